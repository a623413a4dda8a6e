//! Error types for the storage layer.

use std::fmt;
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Which integrity rule a rejected write broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Another row of the same model type has this natural key.
    Unique,
    /// A link points at a missing row, or a deleted row is still linked.
    ReferentialIntegrity,
    /// A required value is absent.
    Required,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unique => f.write_str("uniqueness"),
            Self::ReferentialIntegrity => f.write_str("referential integrity"),
            Self::Required => f.write_str("required field"),
        }
    }
}

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store rejected a write.
    #[error("{kind} constraint violated: {detail}")]
    ConstraintViolation { kind: ConstraintKind, detail: String },

    /// Row not found.
    #[error("row not found: {0}")]
    NotFound(String),

    /// Transaction misuse (nested begin, commit without begin).
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Invalid data read back from the store.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A thread panicked while holding the store lock.
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn constraint(kind: ConstraintKind, detail: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }
}
