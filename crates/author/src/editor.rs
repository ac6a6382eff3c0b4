use scenery_common::Transform;
use scenery_kernel::{
    ComponentKey, ComponentRegistry, NodeKey, Scene, SceneError, SceneLoader, ScenePath,
    SerializeContext, World, WorldError,
};
use scenery_persist::{PersistError, read_scene, scene_to_value};
use serde_json::Value;
use std::collections::HashSet;

/// Errors from edit operations.
#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    World(#[from] WorldError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("no scene at the given host path")]
    UnknownScene,
    #[error("component class {0:?} is not registered")]
    UnknownClass(String),
    #[error("scene was not loaded from a file; nothing to propagate to")]
    NoSource,
    #[error("snapshot restored with errors: {0}")]
    Restore(String),
}

/// Serialized state of one scene before an edit.
#[derive(Debug, Clone)]
struct Snapshot {
    hosts: ScenePath,
    label: &'static str,
    document: Value,
}

/// Editor with undo/redo support for scene authoring.
///
/// Every operation snapshots the edited scene before mutating it. Undo
/// reads the snapshot back into the live scene, so objects keep their ids
/// and anything created since is freed. Scenes are addressed by the host
/// path from the world's root scene.
pub struct Editor {
    undo_stack: Vec<Snapshot>,
    redo_stack: Vec<Snapshot>,
    /// Used when a restored scene hosts child scenes stored by path.
    loader: Option<Box<dyn SceneLoader>>,
}

impl Editor {
    pub fn new() -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            loader: None,
        }
    }

    pub fn with_loader(loader: impl SceneLoader + 'static) -> Self {
        Self {
            loader: Some(Box::new(loader)),
            ..Self::new()
        }
    }

    /// Create a permanent node with a fresh id under `parent` (default: the
    /// scene root).
    pub fn create_node(
        &mut self,
        world: &mut World,
        hosts: &[NodeKey],
        name: &str,
        parent: Option<NodeKey>,
    ) -> Result<NodeKey, EditError> {
        let before = self.capture(world, hosts)?;
        let scene = scene_mut(world, hosts)?;
        let id = scene.find_unique_node_id()?;
        let parent = parent.unwrap_or(scene.root());
        let key = scene.create_node(id, name, Some(parent))?;
        scene.notify_edited(key)?;
        self.commit(world, hosts, "create node", before);
        Ok(key)
    }

    /// Destroy one node. Permanent children become unparented.
    pub fn destroy_node(
        &mut self,
        world: &mut World,
        hosts: &[NodeKey],
        key: NodeKey,
    ) -> Result<(), EditError> {
        let before = self.capture(world, hosts)?;
        scene_mut(world, hosts)?.destroy_node(key)?;
        self.commit(world, hosts, "destroy node", before);
        Ok(())
    }

    /// Destroy a node and every descendant in its scene, leaves first.
    /// Returns the number of nodes destroyed.
    pub fn destroy_subtree(
        &mut self,
        world: &mut World,
        hosts: &[NodeKey],
        key: NodeKey,
    ) -> Result<usize, EditError> {
        let before = self.capture(world, hosts)?;
        let scene = scene_mut(world, hosts)?;
        if key == scene.root() {
            return Err(SceneError::RootNode.into());
        }
        if scene.node(key).is_none() {
            return Err(SceneError::StaleNode(key).into());
        }
        let mut destroyed = 0;
        for node in subtree(scene, key).into_iter().rev() {
            if scene.node(node).is_some() {
                scene.destroy_node(node)?;
                destroyed += 1;
            }
        }
        self.commit(world, hosts, "destroy subtree", before);
        Ok(destroyed)
    }

    /// Move `key` under `parent`, or unparent it, keeping its world pose.
    pub fn reparent(
        &mut self,
        world: &mut World,
        hosts: &[NodeKey],
        key: NodeKey,
        parent: Option<NodeKey>,
    ) -> Result<(), EditError> {
        let before = self.capture(world, hosts)?;
        let scene = scene_mut(world, hosts)?;
        scene.set_parent(key, parent)?;
        scene.notify_edited(key)?;
        self.commit(world, hosts, "reparent", before);
        Ok(())
    }

    pub fn set_local_transform(
        &mut self,
        world: &mut World,
        hosts: &[NodeKey],
        key: NodeKey,
        local: Transform,
    ) -> Result<(), EditError> {
        let before = self.capture(world, hosts)?;
        let scene = scene_mut(world, hosts)?;
        scene
            .node_mut(key)
            .ok_or(SceneError::StaleNode(key))?
            .set_local(local);
        scene.notify_edited(key)?;
        self.commit(world, hosts, "set transform", before);
        Ok(())
    }

    pub fn rename(
        &mut self,
        world: &mut World,
        hosts: &[NodeKey],
        key: NodeKey,
        name: &str,
    ) -> Result<(), EditError> {
        let before = self.capture(world, hosts)?;
        let scene = scene_mut(world, hosts)?;
        scene
            .node_mut(key)
            .ok_or(SceneError::StaleNode(key))?
            .set_name(name);
        scene.notify_edited(key)?;
        self.commit(world, hosts, "rename", before);
        Ok(())
    }

    /// Attach a new component of the class registered as `class`.
    pub fn add_component(
        &mut self,
        world: &mut World,
        hosts: &[NodeKey],
        node: NodeKey,
        class: &str,
    ) -> Result<ComponentKey, EditError> {
        let before = self.capture(world, hosts)?;
        let (scene, registry) = world
            .scene_and_registry_mut(hosts)
            .ok_or(EditError::UnknownScene)?;
        let class = registry
            .class_by_name(class)
            .ok_or_else(|| EditError::UnknownClass(class.to_owned()))?
            .id;
        let id = scene.find_unique_component_id()?;
        let key = scene.add_component(node, id, class, registry)?;
        scene.notify_edited(node)?;
        self.commit(world, hosts, "add component", before);
        Ok(key)
    }

    pub fn remove_component(
        &mut self,
        world: &mut World,
        hosts: &[NodeKey],
        key: ComponentKey,
    ) -> Result<(), EditError> {
        let before = self.capture(world, hosts)?;
        let scene = scene_mut(world, hosts)?;
        let node = scene
            .component(key)
            .ok_or(SceneError::StaleComponent(key))?
            .parent();
        scene.destroy_component(key)?;
        if let Some(node) = node {
            scene.notify_edited(node)?;
        }
        self.commit(world, hosts, "remove component", before);
        Ok(())
    }

    /// Run the component's interactive edit hook. Recorded only if the
    /// hook reports a change.
    pub fn edit_component(
        &mut self,
        world: &mut World,
        hosts: &[NodeKey],
        key: ComponentKey,
    ) -> Result<bool, EditError> {
        let before = self.capture(world, hosts)?;
        let scene = scene_mut(world, hosts)?;
        let slot = scene
            .component_mut(key)
            .ok_or(SceneError::StaleComponent(key))?;
        let node = slot.parent();
        let changed = slot.behavior_mut().is_some_and(|behavior| behavior.edit());
        if !changed {
            return Ok(false);
        }
        if let Some(node) = node {
            scene.notify_edited(node)?;
        }
        self.commit(world, hosts, "edit component", before);
        Ok(true)
    }

    /// Undo the last edit. Returns true if an operation was undone.
    pub fn undo(&mut self, world: &mut World) -> Result<bool, EditError> {
        let Some(snapshot) = self.undo_stack.pop() else {
            return Ok(false);
        };
        let current = self.swap(world, snapshot)?;
        self.redo_stack.push(current);
        Ok(true)
    }

    /// Redo the last undone edit. Returns true if an operation was redone.
    pub fn redo(&mut self, world: &mut World) -> Result<bool, EditError> {
        let Some(snapshot) = self.redo_stack.pop() else {
            return Ok(false);
        };
        let current = self.swap(world, snapshot)?;
        self.undo_stack.push(current);
        Ok(true)
    }

    /// Re-read the scene at `hosts` into every other live instance of the
    /// same scene file. Returns the number of instances updated.
    pub fn propagate(&self, world: &mut World, hosts: &[NodeKey]) -> Result<usize, EditError> {
        let source = world
            .root()
            .scene_at(hosts)
            .ok_or(EditError::UnknownScene)?
            .source()
            .ok_or(EditError::NoSource)?
            .to_owned();
        let document = self.capture(world, hosts)?;
        let mut updated = 0;
        for target in world.locate_instances(&source) {
            if target.as_slice() == hosts {
                continue;
            }
            self.restore(world, &target, document.clone())?;
            updated += 1;
        }
        tracing::info!(path = %source, updated, "propagated scene edit");
        Ok(updated)
    }

    /// Number of operations on the undo stack.
    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    /// Number of operations on the redo stack.
    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Label of the edit the next undo reverts.
    pub fn undo_label(&self) -> Option<&'static str> {
        self.undo_stack.last().map(|snapshot| snapshot.label)
    }

    fn context<'a>(
        &'a self,
        registry: &'a ComponentRegistry,
        world_depth: u32,
        hosts: &[NodeKey],
    ) -> SerializeContext<'a> {
        let mut ctx = SerializeContext::new(registry).with_max_depth(world_depth);
        ctx.depth = u32::try_from(hosts.len()).unwrap_or(u32::MAX);
        match self.loader.as_deref() {
            Some(loader) => ctx.with_loader(loader),
            None => ctx,
        }
    }

    fn capture(&self, world: &mut World, hosts: &[NodeKey]) -> Result<Value, EditError> {
        let max_depth = world.config().max_nesting_depth;
        let (scene, registry) = world
            .scene_and_registry_mut(hosts)
            .ok_or(EditError::UnknownScene)?;
        Ok(scene_to_value(scene, self.context(registry, max_depth, hosts))?)
    }

    fn restore(&self, world: &mut World, hosts: &[NodeKey], document: Value) -> Result<(), EditError> {
        let max_depth = world.config().max_nesting_depth;
        let (scene, registry) = world
            .scene_and_registry_mut(hosts)
            .ok_or(EditError::UnknownScene)?;
        let report = read_scene(scene, document, self.context(registry, max_depth, hosts));
        world.flush();
        match report.error {
            Some(error) => Err(EditError::Restore(error)),
            None => Ok(()),
        }
    }

    /// Restore `snapshot` and return the state it replaced.
    fn swap(&self, world: &mut World, snapshot: Snapshot) -> Result<Snapshot, EditError> {
        let Snapshot {
            hosts,
            label,
            document,
        } = snapshot;
        let current = self.capture(world, &hosts)?;
        self.restore(world, &hosts, document)?;
        tracing::debug!(label, "restored scene snapshot");
        Ok(Snapshot {
            hosts,
            label,
            document: current,
        })
    }

    fn commit(&mut self, world: &mut World, hosts: &[NodeKey], label: &'static str, before: Value) {
        self.undo_stack.push(Snapshot {
            hosts: ScenePath::from_slice(hosts),
            label,
            document: before,
        });
        self.redo_stack.clear();
        world.flush();
        tracing::debug!(label, depth = hosts.len(), "recorded edit");
    }
}

impl Default for Editor {
    fn default() -> Self {
        Self::new()
    }
}

/// `key` and its descendants, parents before children. Child links are
/// resolved by id, so this also works on a scene that was just read.
fn subtree(scene: &Scene, key: NodeKey) -> Vec<NodeKey> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![key];
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        let Some(node) = scene.node(current) else {
            continue;
        };
        order.push(current);
        for child in node.child_refs().iter().rev() {
            let mut child = *child;
            if scene.resolve_reference(&mut child) {
                stack.extend(child.handle());
            }
        }
    }
    order
}

fn scene_mut<'w>(world: &'w mut World, hosts: &[NodeKey]) -> Result<&'w mut Scene, EditError> {
    world
        .root_mut()
        .scene_at_mut(hosts)
        .ok_or(EditError::UnknownScene)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use scenery_common::{SceneId, UpdatePhase};
    use scenery_ecs::{Spin, register_stock_components};
    use scenery_kernel::{Address, Behavior, ComponentType, NodeEvent};

    #[derive(Default)]
    struct EditWatcher {
        edits: u32,
    }

    impl Behavior for EditWatcher {
        fn on_node_event(&mut self, event: NodeEvent, _source: SceneId) {
            if event == NodeEvent::Edit {
                self.edits += 1;
            }
        }
    }

    impl ComponentType for EditWatcher {
        const NAME: &'static str = "EditWatcher";
    }

    fn world() -> World {
        let mut registry = ComponentRegistry::new();
        register_stock_components(&mut registry).unwrap();
        registry.register::<EditWatcher>().unwrap();
        World::new().with_registry(registry)
    }

    fn names(world: &World) -> Vec<String> {
        let mut names: Vec<String> = world
            .root()
            .nodes()
            .map(|(_, node)| node.name().to_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn create_and_undo() {
        let mut world = world();
        let mut editor = Editor::new();

        editor.create_node(&mut world, &[], "Lamp", None).unwrap();
        assert_eq!(world.root().node_count(), 2);
        assert_eq!(editor.undo_label(), Some("create node"));

        assert!(editor.undo(&mut world).unwrap());
        assert_eq!(world.root().node_count(), 1);
    }

    #[test]
    fn create_undo_redo_keeps_id() {
        let mut world = world();
        let mut editor = Editor::new();

        let key = editor.create_node(&mut world, &[], "Lamp", None).unwrap();
        let id = world.root().node(key).unwrap().id();
        editor.undo(&mut world).unwrap();
        editor.redo(&mut world).unwrap();

        let key = world.root().node_by_id(id).unwrap();
        assert_eq!(world.root().node(key).unwrap().name(), "Lamp");
        assert_eq!(
            world.root().node(key).unwrap().parent_ref().map(|p| p.id()),
            Some(world.root().root_id())
        );
    }

    #[test]
    fn destroy_and_undo_restores_components() {
        let mut world = world();
        let mut editor = Editor::new();

        let node = editor.create_node(&mut world, &[], "Fan", None).unwrap();
        let spin = editor
            .add_component(&mut world, &[], node, Spin::NAME)
            .unwrap();
        let component_id = world.root().component(spin).unwrap().id();
        world
            .root_mut()
            .component_mut(spin)
            .unwrap()
            .get_mut::<Spin>()
            .unwrap()
            .speed = 3.0;

        editor.destroy_node(&mut world, &[], node).unwrap();
        assert_eq!(world.root().component_count(), 0);

        editor.undo(&mut world).unwrap();
        let spin = world.root().component_by_id(component_id).unwrap();
        assert_eq!(
            world.root().component(spin).unwrap().get::<Spin>().unwrap().speed,
            3.0
        );
        assert_eq!(names(&world), vec!["Fan", "Root"]);
    }

    #[test]
    fn destroy_subtree_removes_descendants() {
        let mut world = world();
        let mut editor = Editor::new();

        let a = editor.create_node(&mut world, &[], "A", None).unwrap();
        let b = editor.create_node(&mut world, &[], "B", Some(a)).unwrap();
        editor.create_node(&mut world, &[], "C", Some(b)).unwrap();
        editor.create_node(&mut world, &[], "D", None).unwrap();

        assert_eq!(editor.destroy_subtree(&mut world, &[], a).unwrap(), 3);
        assert_eq!(names(&world), vec!["D", "Root"]);

        editor.undo(&mut world).unwrap();
        assert_eq!(names(&world), vec!["A", "B", "C", "D", "Root"]);
    }

    #[test]
    fn destroy_subtree_refuses_root() {
        let mut world = world();
        let mut editor = Editor::new();
        let root = world.root().root();
        assert!(matches!(
            editor.destroy_subtree(&mut world, &[], root),
            Err(EditError::Scene(SceneError::RootNode))
        ));
        assert!(!editor.can_undo());
    }

    #[test]
    fn reparent_keeps_world_pose_and_undoes() {
        let mut world = world();
        let mut editor = Editor::new();
        world.init().unwrap();
        world.post_init().unwrap();

        let a = editor.create_node(&mut world, &[], "A", None).unwrap();
        let b = editor.create_node(&mut world, &[], "B", None).unwrap();
        editor
            .set_local_transform(&mut world, &[], a, Transform::from_position(Vec3::X))
            .unwrap();
        editor
            .set_local_transform(&mut world, &[], b, Transform::from_position(2.0 * Vec3::Y))
            .unwrap();
        world.update(0.0, UpdatePhase::Hierarchy).unwrap();

        editor.reparent(&mut world, &[], b, Some(a)).unwrap();
        let node = world.root().node(b).unwrap();
        assert_eq!(node.parent(), Some(a));
        assert!(node.local().position.abs_diff_eq(Vec3::new(-1.0, 2.0, 0.0), 1e-6));
        world.update(0.0, UpdatePhase::Hierarchy).unwrap();
        let world_position = Vec3::from(world.root().node(b).unwrap().world().translation);
        assert!(world_position.abs_diff_eq(2.0 * Vec3::Y, 1e-6));

        editor.undo(&mut world).unwrap();
        let b = world.root().node_by_id(SceneId::new(3)).unwrap();
        let node = world.root().node(b).unwrap();
        assert_eq!(node.parent(), Some(world.root().root()));
        assert!(node.local().position.abs_diff_eq(2.0 * Vec3::Y, 1e-6));
    }

    #[test]
    fn rename_fires_on_edit() {
        let mut world = world();
        let mut editor = Editor::new();

        let node = editor.create_node(&mut world, &[], "Sign", None).unwrap();
        let watcher = editor
            .add_component(&mut world, &[], node, EditWatcher::NAME)
            .unwrap();
        world
            .root_mut()
            .node_mut(node)
            .unwrap()
            .register_callback(NodeEvent::Edit, Address::local(watcher))
            .unwrap();

        editor.rename(&mut world, &[], node, "Billboard").unwrap();
        let edits = world
            .root()
            .component(watcher)
            .unwrap()
            .get::<EditWatcher>()
            .unwrap()
            .edits;
        assert_eq!(edits, 1);
        assert_eq!(world.root().node(node).unwrap().name(), "Billboard");
    }

    #[test]
    fn unknown_class_is_rejected() {
        let mut world = world();
        let mut editor = Editor::new();
        let root = world.root().root();
        assert!(matches!(
            editor.add_component(&mut world, &[], root, "Nope"),
            Err(EditError::UnknownClass(name)) if name == "Nope"
        ));
        assert_eq!(editor.undo_count(), 0);
    }

    #[test]
    fn remove_component_and_undo() {
        let mut world = world();
        let mut editor = Editor::new();
        let root = world.root().root();
        let spin = editor
            .add_component(&mut world, &[], root, Spin::NAME)
            .unwrap();
        editor.remove_component(&mut world, &[], spin).unwrap();
        assert_eq!(world.root().component_count(), 0);
        editor.undo(&mut world).unwrap();
        assert_eq!(world.root().component_count(), 1);
    }

    #[test]
    fn redo_cleared_on_new_edit() {
        let mut world = world();
        let mut editor = Editor::new();

        editor.create_node(&mut world, &[], "A", None).unwrap();
        editor.undo(&mut world).unwrap();
        assert!(editor.can_redo());

        editor.create_node(&mut world, &[], "B", None).unwrap();
        assert!(!editor.can_redo());
        assert_eq!(editor.redo_count(), 0);
    }

    #[test]
    fn undo_redo_empty_return_false() {
        let mut world = world();
        let mut editor = Editor::new();
        assert!(!editor.undo(&mut world).unwrap());
        assert!(!editor.redo(&mut world).unwrap());
    }

    #[test]
    fn propagate_updates_other_instances() {
        let mut world = world();
        let mut editor = Editor::new();
        let (scene, _) = world.scene_and_registry_mut(&[]).unwrap();
        let root = scene.root();
        let first = scene.create_node(SceneId::new(2), "H1", Some(root)).unwrap();
        let second = scene.create_node(SceneId::new(3), "H2", Some(root)).unwrap();
        for host in [first, second] {
            let mut prefab = Scene::new();
            prefab.set_source(Some("prefab.json".into()));
            scene.attach_child_scene(host, prefab).unwrap();
        }
        world.flush();
        assert_eq!(world.scene_instances("prefab.json").len(), 2);

        editor
            .create_node(&mut world, &[first], "Added", None)
            .unwrap();
        assert_eq!(editor.propagate(&mut world, &[first]).unwrap(), 1);

        let other = world.root().scene_at(&[second]).unwrap();
        assert!(other.nodes().any(|(_, node)| node.name() == "Added"));
    }

    #[test]
    fn propagate_requires_source() {
        let mut world = world();
        let editor = Editor::new();
        assert!(matches!(
            editor.propagate(&mut world, &[]),
            Err(EditError::NoSource)
        ));
    }
}
