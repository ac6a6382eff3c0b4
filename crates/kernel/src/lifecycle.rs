//! Init / PostInit / Shutdown for scenes, nodes and components.

use crate::component::{Behavior, ComponentContext, ComponentSlot};
use crate::error::{SceneError, expect_state};
use crate::node::{NodeEvent, SceneNode};
use crate::reference::{ComponentKey, LocalReference, NodeKey, ScenePath};
use crate::scene::Scene;
use glam::Affine3A;
use scenery_common::LifecycleState;
use smallvec::SmallVec;
use std::collections::HashSet;

fn not_running(object: &'static str) -> SceneError {
    SceneError::Lifecycle {
        object,
        expected: "Init or PostInit",
        found: LifecycleState::Shutdown,
    }
}

impl Scene {
    /// Resolve the hierarchy and init every node, child scenes first.
    pub fn init(&mut self) -> Result<(), SceneError> {
        self.init_at(ScenePath::new())
    }

    /// Init with `path` as this scene's position below the lifecycle root.
    /// Callback listener addresses registered during init are built from it.
    pub(crate) fn init_at(&mut self, path: ScenePath) -> Result<(), SceneError> {
        expect_state("scene", self.state, LifecycleState::Shutdown)?;
        let _span = tracing::debug_span!("scene_init", nodes = self.nodes.len()).entered();
        self.path = path;
        self.resolve_hierarchy();
        self.update_hierarchy(Affine3A::IDENTITY);
        for key in self.lifecycle_order() {
            let pending = self
                .nodes
                .get(key)
                .is_some_and(|node| node.state == LifecycleState::Shutdown);
            if pending {
                self.init_node(key)?;
            }
        }
        self.state = LifecycleState::Init;
        Ok(())
    }

    pub fn post_init(&mut self) -> Result<(), SceneError> {
        expect_state("scene", self.state, LifecycleState::Init)?;
        for key in self.lifecycle_order() {
            let pending = self
                .nodes
                .get(key)
                .is_some_and(|node| node.state == LifecycleState::Init);
            if pending {
                self.post_init_node(key)?;
            }
        }
        self.state = LifecycleState::PostInit;
        Ok(())
    }

    /// Shut every node down in reverse init order.
    pub fn shutdown(&mut self) -> Result<(), SceneError> {
        if self.state == LifecycleState::Shutdown {
            return Err(not_running("scene"));
        }
        let _span = tracing::debug_span!("scene_shutdown", nodes = self.nodes.len()).entered();
        let mut order = self.lifecycle_order();
        order.reverse();
        let ordered: HashSet<NodeKey> = order.iter().copied().collect();
        let stragglers: Vec<NodeKey> = self
            .nodes
            .keys()
            .filter(|key| !ordered.contains(key))
            .collect();
        for key in order.into_iter().chain(stragglers) {
            let running = self
                .nodes
                .get(key)
                .is_some_and(|node| node.state != LifecycleState::Shutdown);
            if running {
                if let Err(err) = self.shutdown_node(key) {
                    tracing::warn!(%err, "node failed to shut down");
                }
            }
        }
        self.state = LifecycleState::Shutdown;
        Ok(())
    }

    /// Init a single node: its child scene, then its components.
    pub fn init_node(&mut self, key: NodeKey) -> Result<(), SceneError> {
        let node = self.nodes.get(key).ok_or(SceneError::StaleNode(key))?;
        expect_state("node", node.state, LifecycleState::Shutdown)?;
        if node.child_scene.is_some() {
            let mut path = self.path.clone();
            path.push(key);
            if let Some(child) = self
                .nodes
                .get_mut(key)
                .and_then(|node| node.child_scene.as_deref_mut())
            {
                if child.state == LifecycleState::Shutdown {
                    child.init_at(path)?;
                }
            }
        }
        for component in self.resolve_components(key) {
            let pending = self
                .components
                .get(component)
                .is_some_and(|slot| slot.state == LifecycleState::Shutdown);
            if pending {
                self.init_component(component)?;
            }
        }
        if let Some(node) = self.nodes.get_mut(key) {
            node.state = LifecycleState::Init;
        }
        self.fire(key, NodeEvent::Init);
        Ok(())
    }

    pub fn post_init_node(&mut self, key: NodeKey) -> Result<(), SceneError> {
        let node = self.nodes.get(key).ok_or(SceneError::StaleNode(key))?;
        expect_state("node", node.state, LifecycleState::Init)?;
        if let Some(child) = self
            .nodes
            .get_mut(key)
            .and_then(|node| node.child_scene.as_deref_mut())
        {
            if child.state == LifecycleState::Init {
                child.post_init()?;
            }
        }
        let components: Vec<ComponentKey> = self
            .nodes
            .get(key)
            .map(|node| node.components().collect())
            .unwrap_or_default();
        for component in components {
            let pending = self
                .components
                .get(component)
                .is_some_and(|slot| slot.state == LifecycleState::Init);
            if pending {
                self.post_init_component(component)?;
            }
        }
        if let Some(node) = self.nodes.get_mut(key) {
            node.state = LifecycleState::PostInit;
        }
        self.fire(key, NodeEvent::PostInit);
        Ok(())
    }

    /// Fire OnShutdown, destroy transient children, release the child scene,
    /// destroy transient components and detach permanent ones.
    pub fn shutdown_node(&mut self, key: NodeKey) -> Result<(), SceneError> {
        let node = self.nodes.get(key).ok_or(SceneError::StaleNode(key))?;
        if node.state == LifecycleState::Shutdown {
            return Err(not_running("node"));
        }
        self.fire(key, NodeEvent::Shutdown);

        let transient: Vec<NodeKey> = self
            .nodes
            .get(key)
            .map(|node| {
                node.children
                    .iter()
                    .filter(|child| child.is_transient())
                    .filter_map(LocalReference::handle)
                    .collect()
            })
            .unwrap_or_default();
        for child in transient {
            if let Err(err) = self.remove_node(child, true) {
                tracing::warn!(%err, "failed to destroy transient child");
            }
        }

        if let Some(mut child) = self
            .nodes
            .get_mut(key)
            .and_then(|node| node.child_scene.take())
        {
            if child.state != LifecycleState::Shutdown {
                if let Err(err) = child.shutdown() {
                    tracing::warn!(%err, "child scene failed to shut down");
                }
            }
            self.release_child_scene(key, child);
        }

        let components: Vec<(ComponentKey, bool)> = self
            .nodes
            .get(key)
            .map(|node| {
                node.components
                    .iter()
                    .filter_map(|c| c.handle().map(|handle| (handle, c.is_transient())))
                    .collect()
            })
            .unwrap_or_default();
        for (component, transient) in components {
            if transient {
                if let Err(err) = self.remove_component(component) {
                    tracing::warn!(%err, "failed to destroy transient component");
                }
                continue;
            }
            let running = self
                .components
                .get(component)
                .is_some_and(|slot| slot.state != LifecycleState::Shutdown);
            if running {
                if let Err(err) = self.shutdown_component(component) {
                    tracing::warn!(%err, "component failed to shut down");
                }
            }
            if let Some(slot) = self.components.get_mut(component) {
                slot.parent = None;
            }
        }

        if let Some(node) = self.nodes.get_mut(key) {
            node.callbacks.clear();
            node.state = LifecycleState::Shutdown;
        }
        Ok(())
    }

    pub(crate) fn init_component(&mut self, key: ComponentKey) -> Result<(), SceneError> {
        let slot = self
            .components
            .get(key)
            .ok_or(SceneError::StaleComponent(key))?;
        expect_state("component", slot.state, LifecycleState::Shutdown)?;
        if !self.with_behavior(key, |behavior, ctx| behavior.init(ctx)) {
            tracing::warn!(component = ?key, "component init reported failure");
        }
        if let Some(slot) = self.components.get_mut(key) {
            slot.state = LifecycleState::Init;
        }
        Ok(())
    }

    pub(crate) fn post_init_component(&mut self, key: ComponentKey) -> Result<(), SceneError> {
        let slot = self
            .components
            .get(key)
            .ok_or(SceneError::StaleComponent(key))?;
        expect_state("component", slot.state, LifecycleState::Init)?;
        if !self.with_behavior(key, |behavior, ctx| behavior.post_init(ctx)) {
            tracing::warn!(component = ?key, "component post-init reported failure");
        }
        if let Some(slot) = self.components.get_mut(key) {
            slot.state = LifecycleState::PostInit;
        }
        Ok(())
    }

    pub(crate) fn shutdown_component(&mut self, key: ComponentKey) -> Result<(), SceneError> {
        let slot = self
            .components
            .get(key)
            .ok_or(SceneError::StaleComponent(key))?;
        if slot.state == LifecycleState::Shutdown {
            return Err(not_running("component"));
        }
        self.with_behavior(key, |behavior, ctx| behavior.shutdown(ctx));
        if let Some(slot) = self.components.get_mut(key) {
            slot.state = LifecycleState::Shutdown;
        }
        Ok(())
    }

    /// Run a hook with the behavior lifted out of its slot, so the hook can
    /// mutate the scene. A component without a node or already inside a
    /// hook yields `R::default()`.
    fn with_behavior<R: Default>(
        &mut self,
        key: ComponentKey,
        hook: impl FnOnce(&mut dyn Behavior, &mut ComponentContext<'_>) -> R,
    ) -> R {
        let Some(slot) = self.components.get_mut(key) else {
            return R::default();
        };
        let Some(node) = slot.parent else {
            return R::default();
        };
        let Some(mut behavior) = slot.behavior.take() else {
            return R::default();
        };
        let path = self.path.clone();
        let result = {
            let mut ctx = ComponentContext {
                scene: self,
                path: &path,
                node,
                component: key,
            };
            hook(behavior.as_mut(), &mut ctx)
        };
        if let Some(slot) = self.components.get_mut(key) {
            slot.behavior = Some(behavior);
        }
        result
    }

    /// Resolve parent links, break cycles and make child lists agree with
    /// parent links. Broken links are logged and dropped.
    fn resolve_hierarchy(&mut self) {
        let keys: Vec<NodeKey> = self.nodes.keys().collect();
        for &key in &keys {
            let Some(mut parent) = self.nodes.get(key).and_then(|node| node.parent) else {
                continue;
            };
            let valid = key != self.root
                && self.resolve_reference(&mut parent)
                && parent.handle() != Some(key);
            if !valid {
                tracing::warn!(node = %self.nodes[key].id, parent = %parent.id(), "dropping invalid parent link");
            }
            if let Some(node) = self.nodes.get_mut(key) {
                node.parent = valid.then_some(parent);
            }
        }
        for &key in &keys {
            if self.is_ancestor(key, key) {
                tracing::warn!(node = %self.nodes[key].id, "breaking parent cycle");
                if let Some(node) = self.nodes.get_mut(key) {
                    node.parent = None;
                }
            }
        }
        for &key in &keys {
            let Some(children) = self.nodes.get(key).map(|node| node.children.clone()) else {
                continue;
            };
            let mut kept: SmallVec<[LocalReference<SceneNode>; 4]> = SmallVec::new();
            for mut child in children {
                let owned = self.resolve_reference(&mut child)
                    && child
                        .handle()
                        .and_then(|handle| self.nodes.get(handle))
                        .and_then(SceneNode::parent)
                        == Some(key);
                let duplicate = kept.iter().any(|k| k.handle() == child.handle());
                if owned && !duplicate {
                    kept.push(child);
                } else {
                    tracing::debug!(child = %child.id(), "dropping stale child link");
                }
            }
            if let Some(node) = self.nodes.get_mut(key) {
                node.children = kept;
            }
        }
        for &key in &keys {
            let Some((id, Some(parent))) = self.nodes.get(key).map(|node| (node.id, node.parent()))
            else {
                continue;
            };
            if let Some(parent) = self.nodes.get_mut(parent) {
                if !parent.children.iter().any(|c| c.handle() == Some(key)) {
                    parent.children.push(LocalReference::resolved(id, key));
                }
            }
        }
    }

    /// Resolve a node's component links and claim the components. Returns
    /// the surviving component handles in order.
    fn resolve_components(&mut self, key: NodeKey) -> Vec<ComponentKey> {
        let Some(refs) = self.nodes.get(key).map(|node| node.components.clone()) else {
            return Vec::new();
        };
        let mut kept: SmallVec<[LocalReference<ComponentSlot>; 2]> = SmallVec::new();
        for mut component in refs {
            if !self.resolve_reference(&mut component) {
                tracing::warn!(component = %component.id(), "dropping unresolved component link");
                continue;
            }
            let Some(handle) = component.handle() else {
                continue;
            };
            let Some(slot) = self.components.get_mut(handle) else {
                continue;
            };
            match slot.parent {
                Some(owner) if owner != key && self.nodes.contains_key(owner) => {
                    tracing::warn!(component = %slot.id, "component already attached elsewhere");
                    continue;
                }
                _ => slot.parent = Some(key),
            }
            if !kept.iter().any(|k| k.handle() == Some(handle)) {
                kept.push(component);
            }
        }
        let handles = kept.iter().filter_map(LocalReference::handle).collect();
        if let Some(node) = self.nodes.get_mut(key) {
            node.components = kept;
        }
        handles
    }

    /// Depth-first from the root, then every parentless node.
    pub(crate) fn lifecycle_order(&self) -> Vec<NodeKey> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut seen = HashSet::with_capacity(self.nodes.len());
        let detached = self
            .nodes
            .iter()
            .filter(|(key, node)| *key != self.root && node.parent().is_none())
            .map(|(key, _)| key);
        for start in std::iter::once(self.root).chain(detached) {
            let mut stack = vec![start];
            while let Some(key) = stack.pop() {
                if !seen.insert(key) {
                    continue;
                }
                let Some(node) = self.nodes.get(key) else {
                    continue;
                };
                order.push(key);
                stack.extend(node.children.iter().rev().filter_map(LocalReference::handle));
            }
        }
        order
    }

    /// Bring a freshly created node up to the scene's lifecycle state.
    pub(crate) fn bring_up_node(&mut self, key: NodeKey) -> Result<(), SceneError> {
        if self.state != LifecycleState::Shutdown {
            self.init_node(key)?;
        }
        if self.state == LifecycleState::PostInit {
            self.post_init_node(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::component::{Behavior, ComponentContext, ComponentType};
    use crate::error::SceneError;
    use crate::reference::{Address, ComponentKey, NodeKey};
    use crate::registry::ComponentClass;
    use crate::scene::Scene;
    use crate::{CommandBuffer, ComponentRegistry, SceneCommand};
    use scenery_common::{LifecycleState, SceneId};
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    #[derive(Default)]
    struct Recorder {
        log: Log,
        refuse_init: bool,
    }

    impl Recorder {
        fn record(&self, hook: &str, ctx: &ComponentContext<'_>) {
            let name = ctx.node().map(|node| node.name().to_owned()).unwrap_or_default();
            self.log.borrow_mut().push(format!("{hook}:{name}"));
        }
    }

    impl Behavior for Recorder {
        fn init(&mut self, ctx: &mut ComponentContext<'_>) -> bool {
            self.record("init", ctx);
            !self.refuse_init
        }

        fn post_init(&mut self, ctx: &mut ComponentContext<'_>) -> bool {
            self.record("post", ctx);
            true
        }

        fn shutdown(&mut self, ctx: &mut ComponentContext<'_>) {
            self.record("shutdown", ctx);
        }
    }

    impl ComponentType for Recorder {
        const NAME: &'static str = "Recorder";
    }

    fn attach(scene: &mut Scene, node: NodeKey, id: u16, log: &Log) -> ComponentKey {
        let recorder = Recorder {
            log: log.clone(),
            refuse_init: false,
        };
        scene
            .insert_component(node, SceneId(id), &ComponentClass::of::<Recorder>(), Box::new(recorder))
            .unwrap()
    }

    /// Root -> a -> b, Root -> c, each with a recorder.
    fn recorded() -> (Scene, Log) {
        let log = Log::default();
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        let b = scene.create_node(SceneId(3), "b", Some(a)).unwrap();
        let c = scene.create_node(SceneId(4), "c", Some(root)).unwrap();
        attach(&mut scene, a, 10, &log);
        attach(&mut scene, b, 11, &log);
        attach(&mut scene, c, 12, &log);
        (scene, log)
    }

    fn drain(log: &Log) -> Vec<String> {
        std::mem::take(&mut *log.borrow_mut())
    }

    #[test]
    fn init_runs_parents_first_and_shutdown_reverses() {
        let (mut scene, log) = recorded();
        scene.init().unwrap();
        assert_eq!(drain(&log), ["init:a", "init:b", "init:c"]);
        scene.post_init().unwrap();
        assert_eq!(drain(&log), ["post:a", "post:b", "post:c"]);
        scene.shutdown().unwrap();
        assert_eq!(drain(&log), ["shutdown:c", "shutdown:b", "shutdown:a"]);
        assert!(scene.nodes().all(|(_, node)| node.state() == LifecycleState::Shutdown));
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let mut scene = Scene::new();
        assert!(matches!(scene.post_init(), Err(SceneError::Lifecycle { .. })));
        assert!(matches!(scene.shutdown(), Err(SceneError::Lifecycle { .. })));
        scene.init().unwrap();
        assert!(matches!(scene.init(), Err(SceneError::Lifecycle { .. })));
        scene.shutdown().unwrap();
        assert_eq!(scene.state(), LifecycleState::Shutdown);
    }

    #[test]
    fn refused_init_still_advances() {
        let log = Log::default();
        let mut scene = Scene::new();
        let root = scene.root();
        let recorder = Recorder {
            log: log.clone(),
            refuse_init: true,
        };
        let key = scene
            .insert_component(root, SceneId(2), &ComponentClass::of::<Recorder>(), Box::new(recorder))
            .unwrap();
        scene.init().unwrap();
        assert_eq!(scene.component(key).unwrap().state(), LifecycleState::Init);
        assert_eq!(drain(&log), ["init:Root"]);
    }

    #[test]
    fn late_objects_catch_up_with_the_scene() {
        let (mut scene, log) = recorded();
        scene.init().unwrap();
        scene.post_init().unwrap();
        drain(&log);

        let root = scene.root();
        let late = scene.create_node(SceneId(20), "late", Some(root)).unwrap();
        assert_eq!(scene.node(late).unwrap().state(), LifecycleState::PostInit);
        let component = attach(&mut scene, late, 21, &log);
        assert_eq!(scene.component(component).unwrap().state(), LifecycleState::PostInit);
        assert_eq!(drain(&log), ["init:late", "post:late"]);
    }

    #[test]
    fn shutdown_drops_transients_and_keeps_permanent_components() {
        let log = Log::default();
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        let kept = attach(&mut scene, a, 3, &log);
        let extra = scene
            .add_transient_component(a, &ComponentClass::of::<Recorder>(), Box::new(Recorder::default()))
            .unwrap();
        let helper = scene.create_transient_node("helper", a).unwrap();
        scene.init().unwrap();
        scene.shutdown().unwrap();

        assert!(scene.component(extra).is_none());
        assert!(scene.node(helper).is_none());
        assert_eq!(scene.component(kept).unwrap().parent(), None);
        assert_eq!(scene.node(a).unwrap().component_refs().len(), 1);

        scene.init().unwrap();
        let slot = scene.component(kept).unwrap();
        assert_eq!(slot.parent(), Some(a));
        assert_eq!(slot.state(), LifecycleState::Init);
    }

    #[test]
    fn shutdown_is_allowed_straight_from_init() {
        let (mut scene, log) = recorded();
        scene.init().unwrap();
        drain(&log);
        scene.shutdown().unwrap();
        assert_eq!(drain(&log).len(), 3);
    }

    #[test]
    fn broken_parent_links_are_dropped_on_init() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        let b = scene.create_node(SceneId(3), "b", Some(a)).unwrap();
        scene.destroy_node(a).unwrap();
        scene.init().unwrap();
        assert_eq!(scene.node(b).unwrap().parent(), None);
        assert_eq!(scene.node(b).unwrap().state(), LifecycleState::Init);
    }

    #[derive(Default)]
    struct SelfDisabling;

    impl Behavior for SelfDisabling {
        fn post_init(&mut self, ctx: &mut ComponentContext<'_>) -> bool {
            ctx.defer(SceneCommand::SetActive {
                node: Address::local(ctx.node),
                active: false,
            });
            true
        }
    }

    impl ComponentType for SelfDisabling {
        const NAME: &'static str = "SelfDisabling";
    }

    #[test]
    fn hooks_queue_structural_changes() {
        let mut scene = Scene::new();
        let root = scene.root();
        let a = scene.create_node(SceneId(2), "a", Some(root)).unwrap();
        scene
            .insert_component(a, SceneId(3), &ComponentClass::of::<SelfDisabling>(), Box::new(SelfDisabling))
            .unwrap();
        scene.init().unwrap();
        scene.post_init().unwrap();
        assert_eq!(scene.deferred().len(), 1);
        assert!(scene.node(a).unwrap().is_active());

        let report = scene.flush_deferred(&ComponentRegistry::new());
        assert_eq!(report.applied, 1);
        assert!(!scene.node(a).unwrap().is_active());
        assert!(scene.deferred().is_empty());
        assert!(CommandBuffer::new().is_empty());
    }
}
