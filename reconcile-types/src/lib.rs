//! Core type definitions for the reconcile engine.
//!
//! This crate defines the plugin-agnostic types every other crate depends on:
//! - Backing-store row and run identifiers (UUID v7)
//! - Sync source names
//! - Natural keys (the canonical form of an entity's identifier values)
//! - Attribute values, including typed relationship references
//!
//! Entity Types, normalization and everything schema-shaped live in
//! `reconcile-model`.

mod ids;
mod key;
mod value;

pub use ids::{RecordId, RunId, SourceId};
pub use key::{KEY_SEPARATOR, NaturalKey};
pub use value::{Reference, Value};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid natural key: {0}")]
    InvalidKey(String),
}
