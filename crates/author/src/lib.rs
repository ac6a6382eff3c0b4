//! Scene authoring: editing operations, undo/redo, edit propagation.
//!
//! # Invariants
//! - Every editor operation is reversible.
//! - Undo and redo restore a scene through the same read path as a reload,
//!   so ids survive and unseen objects are freed.
//! - Node edits fire the node's OnEdit callbacks.

pub mod editor;

pub use editor::{EditError, Editor};
