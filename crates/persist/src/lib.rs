//! Persistence: the JSON serializer, scene and world documents, and the
//! binary scene cache.
//!
//! # Invariants
//! - A document written from a scene reads back into an isomorphic scene.
//! - Transient objects never reach a document.
//! - Cache files are verified before use; corruption is fail-closed.

pub mod binary;
pub mod document;
pub mod json;

pub use document::{
    FileSceneLoader, Format, LoadReport, load_scene, load_world, read_document, read_scene,
    save_scene, save_world, scene_to_value, world_to_value, write_document,
};
pub use json::JsonSerializer;

/// Errors from reading and writing scene files.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("not a scene cache file")]
    BadMagic,
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("serializer failed: {0}")]
    Serializer(String),
}
