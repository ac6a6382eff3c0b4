use crate::component::ComponentSlot;
use crate::error::SceneError;
use crate::reference::{ComponentAddress, ComponentKey, LocalReference, NodeKey};
use crate::scene::Scene;
use glam::Affine3A;
use scenery_common::{LifecycleState, NodeFlags, SceneId, Transform};
use smallvec::SmallVec;

/// Node events listeners can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEvent {
    Init,
    PostInit,
    Shutdown,
    Edit,
}

/// A node event queued for delivery to a listening component.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub event: NodeEvent,
    /// Local id of the node the event fired on.
    pub source: SceneId,
    pub listener: ComponentAddress,
}

/// Spatial and hierarchical unit of a scene.
///
/// Owned by its scene's pool. Parent, children and components are held as
/// references; the child scene, if any, is owned.
pub struct SceneNode {
    pub(crate) id: SceneId,
    pub(crate) name: String,
    pub(crate) flags: NodeFlags,
    pub(crate) state: LifecycleState,
    pub(crate) initial: Transform,
    pub(crate) local: Transform,
    pub(crate) world: Affine3A,
    pub(crate) parent: Option<LocalReference<SceneNode>>,
    pub(crate) children: SmallVec<[LocalReference<SceneNode>; 4]>,
    pub(crate) components: SmallVec<[LocalReference<ComponentSlot>; 2]>,
    pub(crate) child_scene: Option<Box<Scene>>,
    pub(crate) callbacks: Vec<(NodeEvent, ComponentAddress)>,
}

impl SceneNode {
    pub(crate) fn new(id: SceneId, name: impl Into<String>, flags: NodeFlags) -> Self {
        Self {
            id,
            name: name.into(),
            flags,
            state: LifecycleState::Shutdown,
            initial: Transform::IDENTITY,
            local: Transform::IDENTITY,
            world: Affine3A::IDENTITY,
            parent: None,
            children: SmallVec::new(),
            components: SmallVec::new(),
            child_scene: None,
            callbacks: Vec::new(),
        }
    }

    pub fn id(&self) -> SceneId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    /// Replace the flags. The transient bit is fixed at creation.
    pub fn set_flags(&mut self, flags: NodeFlags) {
        let transient = self.flags & NodeFlags::TRANSIENT;
        self.flags = (flags - NodeFlags::TRANSIENT) | transient;
    }

    pub fn set_active(&mut self, active: bool) {
        self.flags.set(NodeFlags::ACTIVE, active);
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(NodeFlags::ACTIVE)
    }

    pub fn is_transient(&self) -> bool {
        self.id.is_transient()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Local transform as last loaded from data.
    pub fn initial(&self) -> &Transform {
        &self.initial
    }

    pub fn local(&self) -> &Transform {
        &self.local
    }

    /// Takes effect on `world` at the next Hierarchy phase.
    pub fn set_local(&mut self, local: Transform) {
        self.local = local;
    }

    pub fn world(&self) -> Affine3A {
        self.world
    }

    pub fn parent(&self) -> Option<NodeKey> {
        self.parent.and_then(|parent| parent.handle())
    }

    pub fn parent_ref(&self) -> Option<&LocalReference<SceneNode>> {
        self.parent.as_ref()
    }

    /// Resolved children in order.
    pub fn children(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.children.iter().filter_map(LocalReference::handle)
    }

    pub fn child_refs(&self) -> &[LocalReference<SceneNode>] {
        &self.children
    }

    /// Resolved components in order.
    pub fn components(&self) -> impl Iterator<Item = ComponentKey> + '_ {
        self.components.iter().filter_map(LocalReference::handle)
    }

    pub fn component_refs(&self) -> &[LocalReference<ComponentSlot>] {
        &self.components
    }

    pub fn child_scene(&self) -> Option<&Scene> {
        self.child_scene.as_deref()
    }

    pub fn child_scene_mut(&mut self) -> Option<&mut Scene> {
        self.child_scene.as_deref_mut()
    }

    /// Subscribe `listener` to `event` on this node.
    pub fn register_callback(
        &mut self,
        event: NodeEvent,
        listener: ComponentAddress,
    ) -> Result<(), SceneError> {
        if self
            .callbacks
            .iter()
            .any(|(e, l)| *e == event && *l == listener)
        {
            return Err(SceneError::DuplicateCallback(event));
        }
        self.callbacks.push((event, listener));
        Ok(())
    }

    pub fn unregister_callback(
        &mut self,
        event: NodeEvent,
        listener: &ComponentAddress,
    ) -> Result<(), SceneError> {
        let index = self
            .callbacks
            .iter()
            .position(|(e, l)| *e == event && l == listener)
            .ok_or(SceneError::UnknownCallback(event))?;
        self.callbacks.remove(index);
        Ok(())
    }

    pub fn callback_count(&self, event: NodeEvent) -> usize {
        self.callbacks.iter().filter(|(e, _)| *e == event).count()
    }
}

impl std::fmt::Debug for SceneNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("state", &self.state)
            .field("children", &self.children.len())
            .field("components", &self.components.len())
            .field("child_scene", &self.child_scene.is_some())
            .finish()
    }
}

/// Transform-only view of a node handed to batched component updates.
///
/// Structure (parent, children, components) is not reachable through it.
pub struct NodeMut<'a> {
    key: NodeKey,
    node: &'a mut SceneNode,
}

impl<'a> NodeMut<'a> {
    pub(crate) fn new(key: NodeKey, node: &'a mut SceneNode) -> Self {
        Self { key, node }
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn id(&self) -> SceneId {
        self.node.id
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn flags(&self) -> NodeFlags {
        self.node.flags
    }

    pub fn local(&self) -> &Transform {
        &self.node.local
    }

    pub fn local_mut(&mut self) -> &mut Transform {
        &mut self.node.local
    }

    pub fn set_local(&mut self, local: Transform) {
        self.node.local = local;
    }

    pub fn world(&self) -> Affine3A {
        self.node.world
    }

    pub fn set_world(&mut self, world: Affine3A) {
        self.node.world = world;
    }
}
