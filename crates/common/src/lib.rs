//! Shared value types for the scene runtime.
//!
//! # Invariants
//! - `SceneId(0)` is reserved for transient objects and is never persisted.
//! - `SceneId::fold` is deterministic and platform independent.
//! - Serializer implementations surface only the first error they record.

pub mod hash;
pub mod id;
pub mod serializer;
pub mod types;

pub use hash::{fnv1a_32, fnv1a_64, path_hash};
pub use id::{ParseIdError, SceneGlobalId, SceneId, SceneInstanceId};
pub use serializer::{Field, SerializeMode, Serializer};
pub use types::{LifecycleState, NodeFlags, Transform, UpdatePhase};
