//! Symmetric read/write of scenes through the [`Serializer`] contract, with
//! reconciliation against the live state on read.

use crate::component::ComponentSlot;
use crate::node::SceneNode;
use crate::reference::{ComponentKey, LocalReference, NodeKey, Referent};
use crate::registry::ComponentRegistry;
use crate::scene::Scene;
use scenery_common::{LifecycleState, NodeFlags, SceneId, Serializer};
use smallvec::SmallVec;
use std::collections::HashSet;
use std::fmt;

/// Loads a scene stored at a path, for `ChildScenePath` entries.
pub trait SceneLoader {
    /// Read the scene at `path` into `scene`. Returns false on failure.
    fn load(&self, path: &str, scene: &mut Scene, ctx: SerializeContext<'_>) -> bool;
}

/// Everything a scene read or write needs besides the serializer.
#[derive(Clone, Copy)]
pub struct SerializeContext<'a> {
    pub registry: &'a ComponentRegistry,
    pub loader: Option<&'a dyn SceneLoader>,
    /// Nesting depth of the scene being serialized.
    pub depth: u32,
    pub max_depth: u32,
}

impl<'a> SerializeContext<'a> {
    pub const DEFAULT_MAX_DEPTH: u32 = 16;

    pub fn new(registry: &'a ComponentRegistry) -> Self {
        Self {
            registry,
            loader: None,
            depth: 0,
            max_depth: Self::DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_loader(self, loader: &'a dyn SceneLoader) -> Self {
        Self {
            loader: Some(loader),
            ..self
        }
    }

    pub fn with_max_depth(self, max_depth: u32) -> Self {
        Self { max_depth, ..self }
    }

    /// Context for a child scene, or `None` past the nesting limit.
    pub fn nested(self) -> Option<Self> {
        (self.depth < self.max_depth).then(|| Self {
            depth: self.depth + 1,
            ..self
        })
    }
}

impl fmt::Debug for SerializeContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializeContext")
            .field("classes", &self.registry.len())
            .field("loader", &self.loader.is_some())
            .field("depth", &self.depth)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

fn reject(s: &mut dyn Serializer, message: String) -> bool {
    tracing::warn!("{message}");
    s.report_error(message);
    false
}

impl Scene {
    /// Write this scene, or read it in place.
    ///
    /// Reading reuses live objects whose id appears in the data and frees
    /// every permanent object whose id does not. Reading into a running
    /// scene shuts it down first and restarts it afterwards. Bad entries
    /// are skipped; the result is false if anything was skipped.
    pub fn serialize(
        &mut self,
        s: &mut dyn Serializer,
        name: Option<&str>,
        ctx: SerializeContext<'_>,
    ) -> bool {
        if !s.begin_object(name) {
            return false;
        }
        let reading = s.is_reading();
        let resume = self.state;
        let reload = reading && resume != LifecycleState::Shutdown;
        if reload {
            tracing::debug!(instance = %self.instance, "reloading running scene");
            if let Err(err) = self.shutdown() {
                tracing::warn!(%err, "scene failed to shut down before reload");
            }
        }

        let ok = if reading {
            self.read_body(s, ctx)
        } else {
            self.write_body(s, ctx)
        };
        s.end_object();

        if reading {
            self.revision = self.revision.wrapping_add(1);
            self.addresses = None;
        }
        if reload {
            let path = self.path.clone();
            let restarted = self.init_at(path).and_then(|()| {
                if resume == LifecycleState::PostInit {
                    self.post_init()
                } else {
                    Ok(())
                }
            });
            if let Err(err) = restarted {
                return reject(s, format!("scene failed to restart after reload: {err}"));
            }
        }
        ok
    }

    fn write_body(&mut self, s: &mut dyn Serializer, ctx: SerializeContext<'_>) -> bool {
        let mut ok = s.value(&mut self.root_id, Some("RootNodeID"));

        let mut nodes: Vec<(SceneId, NodeKey)> = self
            .nodes
            .iter()
            .filter(|(_, node)| !node.is_transient())
            .map(|(key, node)| (node.id, key))
            .collect();
        nodes.sort_unstable();
        let mut len = nodes.len();
        if s.begin_array(&mut len, Some("Nodes")) {
            for (mut id, key) in nodes {
                if !s.begin_object(None) {
                    ok = false;
                    continue;
                }
                ok &= s.value(&mut id, Some("ID"));
                ok &= self.serialize_node_fields(s, key, ctx);
                s.end_object();
            }
            s.end_array();
        } else {
            ok = false;
        }

        let mut components: Vec<(SceneId, ComponentKey)> = self
            .components
            .iter()
            .filter(|(_, slot)| !slot.is_transient())
            .map(|(key, slot)| (slot.id, key))
            .collect();
        components.sort_unstable();
        let mut len = components.len();
        if s.begin_array(&mut len, Some("Components")) {
            for (mut id, key) in components {
                let Some(slot) = self.components.get_mut(key) else {
                    continue;
                };
                if !s.begin_object(None) {
                    ok = false;
                    continue;
                }
                ok &= s.value(&mut id, Some("ID"));
                let mut class = slot.class_name.to_owned();
                ok &= s.value(&mut class, Some("Class"));
                if let Some(behavior) = slot.behavior.as_deref_mut() {
                    if s.begin_object(Some("Data")) {
                        ok &= behavior.serialize(s);
                        s.end_object();
                    } else {
                        ok = false;
                    }
                }
                s.end_object();
            }
            s.end_array();
        } else {
            ok = false;
        }
        ok
    }

    fn read_body(&mut self, s: &mut dyn Serializer, ctx: SerializeContext<'_>) -> bool {
        let mut ok = true;
        let mut root_id = self.root_id;
        if !s.value(&mut root_id, Some("RootNodeID")) || root_id.is_transient() {
            ok = reject(s, "scene has no valid RootNodeID".to_owned());
            root_id = self.root_id;
        }

        let mut seen_nodes = HashSet::new();
        let mut len = 0;
        if s.begin_array(&mut len, Some("Nodes")) {
            for index in 0..len {
                if !s.begin_object(None) {
                    ok = reject(s, format!("node entry {index} is not an object"));
                    continue;
                }
                let mut id = SceneId::TRANSIENT;
                if !s.value(&mut id, Some("ID")) || id.is_transient() {
                    ok = reject(s, format!("node entry {index} has no valid ID"));
                    s.end_object();
                    continue;
                }
                if !seen_nodes.insert(id) {
                    ok = reject(s, format!("node id {id} appears twice"));
                    s.end_object();
                    continue;
                }
                let key = match self.node_ids.get(&id) {
                    Some(&key) => key,
                    None => {
                        let key = self
                            .nodes
                            .insert(SceneNode::new(id, String::new(), NodeFlags::ACTIVE));
                        self.node_ids.insert(id, key);
                        key
                    }
                };
                ok &= self.serialize_node_fields(s, key, ctx);
                s.end_object();
            }
            s.end_array();
        } else {
            ok = reject(s, "scene has no Nodes array".to_owned());
        }

        if !seen_nodes.contains(&root_id) {
            ok = reject(s, format!("root node {root_id} is not among the nodes"));
            if !self.node_ids.contains_key(&root_id) {
                let key = self
                    .nodes
                    .insert(SceneNode::new(root_id, "Root", NodeFlags::ACTIVE));
                self.node_ids.insert(root_id, key);
            }
            seen_nodes.insert(root_id);
        }
        if let Some(&root) = self.node_ids.get(&root_id) {
            self.root = root;
            self.root_id = root_id;
        }

        let mut seen_components = HashSet::new();
        let mut len = 0;
        if s.begin_array(&mut len, Some("Components")) {
            for index in 0..len {
                if !s.begin_object(None) {
                    ok = reject(s, format!("component entry {index} is not an object"));
                    continue;
                }
                ok &= self.read_component(s, index, ctx, &mut seen_components);
                s.end_object();
            }
            s.end_array();
        } else {
            ok = reject(s, "scene has no Components array".to_owned());
        }

        self.reconcile(&seen_nodes, &seen_components);
        ok
    }

    fn read_component(
        &mut self,
        s: &mut dyn Serializer,
        index: usize,
        ctx: SerializeContext<'_>,
        seen: &mut HashSet<SceneId>,
    ) -> bool {
        let mut id = SceneId::TRANSIENT;
        if !s.value(&mut id, Some("ID")) || id.is_transient() {
            return reject(s, format!("component entry {index} has no valid ID"));
        }
        let mut class_name = String::new();
        if !s.value(&mut class_name, Some("Class")) {
            return reject(s, format!("component {id} has no Class"));
        }
        let Some(class) = ctx.registry.class_by_name(&class_name) else {
            return reject(s, format!("component {id} has unknown class {class_name:?}"));
        };
        if !seen.insert(id) {
            return reject(s, format!("component id {id} appears twice"));
        }

        let existing = self
            .component_ids
            .get(&id)
            .copied()
            .filter(|&key| self.components.get(key).is_some_and(|slot| slot.class == class.id));
        let key = match existing {
            Some(key) => key,
            None => {
                if let Some(stale) = self.component_ids.get(&id).copied() {
                    if let Err(err) = self.remove_component(stale) {
                        tracing::warn!(%err, "failed to replace component of another class");
                    }
                }
                let slot = ComponentSlot::new(id, class.id, class.name, (class.create)());
                let key = self.components.insert(slot);
                self.component_ids.insert(id, key);
                key
            }
        };

        if !s.has_field("Data") {
            return true;
        }
        let Some(behavior) = self
            .components
            .get_mut(key)
            .and_then(|slot| slot.behavior.as_deref_mut())
        else {
            return true;
        };
        if !s.begin_object(Some("Data")) {
            return reject(s, format!("component {id} Data is not an object"));
        }
        let ok = behavior.serialize(s);
        s.end_object();
        if !ok {
            tracing::warn!(%id, class = class.name, "component data read with errors");
        }
        ok
    }

    /// Free every permanent object the last read did not mention.
    fn reconcile(&mut self, seen_nodes: &HashSet<SceneId>, seen_components: &HashSet<SceneId>) {
        let stale: Vec<ComponentKey> = self
            .components
            .iter()
            .filter(|(_, slot)| !slot.is_transient() && !seen_components.contains(&slot.id))
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            if let Err(err) = self.remove_component(key) {
                tracing::warn!(%err, "failed to drop component missing from data");
            }
        }
        let stale: Vec<NodeKey> = self
            .nodes
            .iter()
            .filter(|(_, node)| !node.is_transient() && !seen_nodes.contains(&node.id))
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            if let Err(err) = self.remove_node(key, false) {
                tracing::warn!(%err, "failed to drop node missing from data");
            }
        }
    }

    fn serialize_node_fields(
        &mut self,
        s: &mut dyn Serializer,
        key: NodeKey,
        ctx: SerializeContext<'_>,
    ) -> bool {
        let reading = s.is_reading();
        let (parent_label, child_labels, component_labels) = if reading {
            Default::default()
        } else {
            self.reference_labels(key)
        };
        let Some(node) = self.nodes.get_mut(key) else {
            return false;
        };

        let mut ok = s.value(&mut node.name, Some("Name"));

        let mut flags = (node.flags & NodeFlags::PERSISTED).bits();
        if s.value(&mut flags, Some("Flags")) {
            if reading {
                node.flags = NodeFlags::from_bits_truncate(flags) & NodeFlags::PERSISTED;
            }
        } else {
            ok = false;
        }

        let mut local = node.local;
        if s.value(&mut local, Some("LocalTransform")) {
            if reading {
                node.initial = local;
                node.local = local;
            }
        } else {
            ok = false;
        }

        if s.begin_object(Some("Hierarchy")) {
            let mut parent = node.parent.unwrap_or_default();
            ok &= parent.serialize(s, Some("Parent"), &parent_label);
            if reading {
                node.parent = (!parent.is_transient()).then_some(parent);
            }
            ok &= serialize_refs(s, &mut node.children, "Children", &child_labels);
            s.end_object();
        } else {
            ok = false;
        }
        ok &= serialize_refs(s, &mut node.components, "Components", &component_labels);

        ok & self.serialize_child_scene(s, key, ctx)
    }

    /// Labels written next to reference ids: parent name, child names and
    /// component class names.
    fn reference_labels(&self, key: NodeKey) -> (String, Vec<String>, Vec<String>) {
        let Some(node) = self.nodes.get(key) else {
            return Default::default();
        };
        let parent = node
            .parent
            .and_then(|parent| parent.handle())
            .map(|parent| SceneNode::label(self, parent))
            .unwrap_or_default();
        let children = node
            .children
            .iter()
            .filter(|child| !child.is_transient())
            .map(|child| {
                child
                    .handle()
                    .map(|handle| SceneNode::label(self, handle))
                    .unwrap_or_default()
            })
            .collect();
        let components = node
            .components
            .iter()
            .filter(|component| !component.is_transient())
            .map(|component| {
                component
                    .handle()
                    .map(|handle| ComponentSlot::label(self, handle))
                    .unwrap_or_default()
            })
            .collect();
        (parent, children, components)
    }

    fn serialize_child_scene(
        &mut self,
        s: &mut dyn Serializer,
        host: NodeKey,
        ctx: SerializeContext<'_>,
    ) -> bool {
        if !s.is_reading() {
            let Some(child) = self
                .nodes
                .get_mut(host)
                .and_then(|node| node.child_scene.as_deref_mut())
            else {
                return true;
            };
            if let Some(path) = child.source.clone() {
                let mut path = path;
                return s.value(&mut path, Some("ChildScenePath"));
            }
            return match ctx.nested() {
                Some(nested) => child.serialize(s, Some("ChildScene"), nested),
                None => reject(s, "child scene nesting too deep to write".to_owned()),
            };
        }

        let existing_source = self
            .nodes
            .get(host)
            .and_then(|node| node.child_scene.as_deref())
            .map(|child| child.source.clone());

        if s.has_field("ChildScenePath") {
            let mut path = String::new();
            if !s.value(&mut path, Some("ChildScenePath")) {
                return reject(s, "ChildScenePath is not a string".to_owned());
            }
            let Some(nested) = ctx.nested() else {
                tracing::warn!(%path, depth = ctx.depth, "child scene nesting limit reached; skipping");
                self.drop_child_scene(host);
                return true;
            };
            let Some(loader) = ctx.loader else {
                tracing::warn!(%path, "no scene loader available; skipping child scene");
                self.drop_child_scene(host);
                return true;
            };
            if existing_source.as_ref().and_then(Option::as_deref) == Some(path.as_str()) {
                if let Some(child) = self
                    .nodes
                    .get_mut(host)
                    .and_then(|node| node.child_scene.as_deref_mut())
                {
                    return loader.load(&path, child, nested);
                }
            }
            self.drop_child_scene(host);
            let mut child = Scene::new();
            let ok = loader.load(&path, &mut child, nested);
            child.source = Some(path);
            return ok & self.attach_loaded(s, host, child);
        }

        if s.has_field("ChildScene") {
            let Some(nested) = ctx.nested() else {
                tracing::warn!(depth = ctx.depth, "child scene nesting limit reached; skipping");
                self.drop_child_scene(host);
                return true;
            };
            if existing_source == Some(None) {
                if let Some(child) = self
                    .nodes
                    .get_mut(host)
                    .and_then(|node| node.child_scene.as_deref_mut())
                {
                    return child.serialize(s, Some("ChildScene"), nested);
                }
            }
            self.drop_child_scene(host);
            let mut child = Scene::new();
            let ok = child.serialize(s, Some("ChildScene"), nested);
            return ok & self.attach_loaded(s, host, child);
        }

        self.drop_child_scene(host);
        true
    }

    fn attach_loaded(&mut self, s: &mut dyn Serializer, host: NodeKey, child: Scene) -> bool {
        match self.attach_child_scene(host, child) {
            Ok(()) => true,
            Err(err) => reject(s, format!("could not attach child scene: {err}")),
        }
    }

    fn drop_child_scene(&mut self, host: NodeKey) {
        if let Some(child) = self
            .nodes
            .get_mut(host)
            .and_then(|node| node.child_scene.take())
        {
            self.release_child_scene(host, child);
        }
    }
}

/// Permanent references as `[[id, label], ...]`. Reading replaces the
/// permanent entries and keeps transient ones, which are never written.
fn serialize_refs<T, A>(
    s: &mut dyn Serializer,
    refs: &mut SmallVec<A>,
    name: &str,
    labels: &[String],
) -> bool
where
    T: Referent,
    A: smallvec::Array<Item = LocalReference<T>>,
{
    let reading = s.is_reading();
    let mut permanent: Vec<LocalReference<T>> =
        refs.iter().filter(|r| !r.is_transient()).copied().collect();
    let mut len = permanent.len();
    if !s.begin_array(&mut len, Some(name)) {
        return false;
    }
    let mut ok = true;
    if reading {
        let mut read: SmallVec<A> = SmallVec::new();
        for _ in 0..len {
            let mut reference = LocalReference::default();
            ok &= reference.serialize(s, None, "");
            if !reference.is_transient() {
                read.push(reference);
            }
        }
        read.extend(refs.iter().filter(|r| r.is_transient()).copied());
        *refs = read;
    } else {
        for (index, reference) in permanent.iter_mut().enumerate() {
            let label = labels.get(index).map(String::as_str).unwrap_or("");
            ok &= reference.serialize(s, None, label);
        }
    }
    s.end_array();
    ok
}
