//! Scene kernel: the authoritative runtime graph of scenes, nodes and components.
//!
//! # Invariants
//! - Scenes own their nodes and components; every other link is a handle.
//! - A reference's stored id is authoritative; its cached handle is a hint
//!   that is re-validated (generation and id) on every resolution.
//! - Structural changes requested during an update go through the command
//!   queue and are applied between phases.
//! - Lifecycle order is `Shutdown -> Init -> PostInit -> Shutdown` for worlds,
//!   scenes, nodes and components; violations are reported as errors.

pub mod command;
pub mod component;
pub mod error;
mod lifecycle;
pub mod node;
pub mod reference;
pub mod registry;
pub mod scene;
mod serialize;
mod update;
pub mod world;

pub use command::{ApplyReport, CommandBuffer, SceneCommand};
pub use component::{Behavior, ComponentContext, ComponentSlot, ComponentType};
pub use error::SceneError;
pub use node::{NodeEvent, NodeMut, Notification, SceneNode};
pub use reference::{
    Address, ComponentAddress, ComponentKey, GlobalReference, LocalReference, NodeAddress,
    NodeKey, Referent, ScenePath,
};
pub use registry::{
    ClassId, ComponentBatch, ComponentClass, ComponentRegistry, Instance, RegistryError,
};
pub use scene::{GlobalAddressMap, InstanceEvent, Outbox, Scene, Visit};
pub use serialize::{SceneLoader, SerializeContext};
pub use world::{ViewRole, World, WorldConfig, WorldError};

pub mod prelude {
    pub use crate::{
        Behavior, ComponentBatch, ComponentContext, ComponentType, GlobalReference, Instance,
        LocalReference, NodeEvent, NodeKey, Scene, SceneCommand, SceneNode, World,
    };
    pub use scenery_common::{
        LifecycleState, NodeFlags, SceneGlobalId, SceneId, Transform, UpdatePhase,
    };
}
