//! Developer tooling: read-only inspection of worlds and scenes.
//!
//! # Invariants
//! - Tools never mutate the state they inspect.

pub mod inspector;

pub use inspector::{
    ClassCount, RefKind, SceneInspector, SceneSummary, TreeEntry, UnresolvedRef, WorldSummary,
};
