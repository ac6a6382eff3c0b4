//! The component plug-in contract.
//!
//! A concrete component is a [`Behavior`] (per-instance hooks) plus a
//! [`ComponentType`] (class name and batched per-phase update). Instances
//! live in their scene's component pool as [`ComponentSlot`]s.

use crate::command::SceneCommand;
use crate::node::{NodeEvent, SceneNode};
use crate::reference::{Address, ComponentAddress, ComponentKey, NodeKey};
use crate::registry::{ClassId, ComponentBatch};
use crate::scene::Scene;
use scenery_common::{LifecycleState, SceneId, Serializer, UpdatePhase};
use std::any::Any;

/// Access to the concrete type behind a trait object.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-instance hooks of a component.
///
/// Hooks run with the instance temporarily taken out of its slot, so the
/// context may freely mutate the owning scene.
pub trait Behavior: AsAny {
    fn init(&mut self, _ctx: &mut ComponentContext<'_>) -> bool {
        true
    }

    fn post_init(&mut self, _ctx: &mut ComponentContext<'_>) -> bool {
        true
    }

    fn shutdown(&mut self, _ctx: &mut ComponentContext<'_>) {}

    /// Symmetric read/write of the instance data.
    fn serialize(&mut self, _s: &mut dyn Serializer) -> bool {
        true
    }

    /// Interactive editing hook. Returns true if anything changed.
    fn edit(&mut self) -> bool {
        false
    }

    /// A node this instance subscribed to fired `event`.
    fn on_node_event(&mut self, _event: NodeEvent, _source: SceneId) {}
}

impl dyn Behavior {
    pub fn downcast_ref<T: Behavior>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Behavior>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Class-level half of the contract.
pub trait ComponentType: Behavior + Default {
    /// Registered class name; its FNV-1a hash is the class id.
    const NAME: &'static str;

    /// Batched update over every active instance of this class.
    fn update(_batch: &mut ComponentBatch<'_>, _dt: f32, _phase: UpdatePhase) {}
}

/// A component instance in its scene's pool.
pub struct ComponentSlot {
    pub(crate) id: SceneId,
    pub(crate) class: ClassId,
    pub(crate) class_name: &'static str,
    pub(crate) parent: Option<NodeKey>,
    pub(crate) state: LifecycleState,
    pub(crate) behavior: Option<Box<dyn Behavior>>,
}

impl ComponentSlot {
    pub(crate) fn new(
        id: SceneId,
        class: ClassId,
        class_name: &'static str,
        behavior: Box<dyn Behavior>,
    ) -> Self {
        Self {
            id,
            class,
            class_name,
            parent: None,
            state: LifecycleState::Shutdown,
            behavior: Some(behavior),
        }
    }

    pub fn id(&self) -> SceneId {
        self.id
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn class_name(&self) -> &'static str {
        self.class_name
    }

    /// The node this instance is attached to, once attached.
    pub fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_transient(&self) -> bool {
        self.id.is_transient()
    }

    /// `None` only while one of the instance's own hooks is running.
    pub fn behavior(&self) -> Option<&dyn Behavior> {
        self.behavior.as_deref()
    }

    pub fn behavior_mut(&mut self) -> Option<&mut (dyn Behavior + 'static)> {
        self.behavior.as_deref_mut()
    }

    pub fn get<T: Behavior>(&self) -> Option<&T> {
        self.behavior().and_then(|b| b.downcast_ref::<T>())
    }

    pub fn get_mut<T: Behavior>(&mut self) -> Option<&mut T> {
        self.behavior_mut().and_then(|b| b.downcast_mut::<T>())
    }
}

impl std::fmt::Debug for ComponentSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentSlot")
            .field("id", &self.id)
            .field("class", &self.class_name)
            .field("parent", &self.parent)
            .field("state", &self.state)
            .finish()
    }
}

/// What a lifecycle hook can see.
pub struct ComponentContext<'a> {
    /// The scene owning the instance.
    pub scene: &'a mut Scene,
    /// Path of `scene` from the scene the lifecycle call started at.
    pub path: &'a [NodeKey],
    pub node: NodeKey,
    pub component: ComponentKey,
}

impl ComponentContext<'_> {
    /// Address of this instance relative to the lifecycle root; use it as a
    /// callback listener.
    pub fn address(&self) -> ComponentAddress {
        Address::new(self.path.iter().copied().collect(), self.component)
    }

    pub fn node(&self) -> Option<&SceneNode> {
        self.scene.node(self.node)
    }

    /// Queue a structural change, addressed relative to `scene`, for the
    /// next command flush.
    pub fn defer(&mut self, command: SceneCommand) {
        self.scene.defer(command);
    }
}
