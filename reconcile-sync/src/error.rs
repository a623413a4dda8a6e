//! Error types for the sync layer.
//!
//! Two tiers: [`SyncError`] aborts a run before anything is written, while
//! [`EntryError`] is recorded against a single changeset entry and the run
//! moves on to the next one.

use reconcile_model::ModelError;
use reconcile_store::StoreError;
use std::fmt;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Which adapter a load error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// An adapter could not produce a complete snapshot.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The underlying system could not be reached.
    #[error("{adapter} unavailable: {reason}")]
    Unavailable { adapter: String, reason: String },

    /// The underlying system returned data the adapter cannot interpret.
    #[error("malformed data from {adapter}: {reason}")]
    Malformed { adapter: String, reason: String },

    /// A record failed schema validation (e.g. a null identifier).
    #[error("invalid record: {0}")]
    Model(#[from] ModelError),

    /// Backing store error while loading the target side.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The run was cancelled while loading.
    #[error("load cancelled")]
    Cancelled,
}

impl LoadError {
    pub fn malformed(adapter: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            adapter: adapter.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(adapter: &str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            adapter: adapter.to_string(),
            reason: reason.into(),
        }
    }
}

/// Fatal errors: the run stops before any mutation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// One side failed to load; no diff is computed against partial data.
    #[error("failed to load {side} snapshot: {error}")]
    Load {
        side: Side,
        #[source]
        error: LoadError,
    },

    /// Model configuration error, including cyclic Entity Type graphs.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Backing store failure outside any single entry.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A background task died.
    #[error("sync aborted: {0}")]
    Aborted(String),
}

impl SyncError {
    pub fn load(side: Side, error: LoadError) -> Self {
        Self::Load { side, error }
    }
}

/// Why one changeset entry could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    /// A referenced entity is neither in the target nor created earlier in
    /// this run.
    #[error("{field}: unresolved reference to {target}")]
    UnresolvedReference { field: String, target: String },

    /// A polymorphic reference matches more than one candidate type.
    #[error("{field}: reference {key} is ambiguous between {}", candidates.join(", "))]
    AmbiguousReference {
        field: String,
        key: String,
        candidates: Vec<String>,
    },

    /// The backing store rejected the write.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The target row is owned by another source.
    #[error("owned by {owner}")]
    OwnershipConflict { owner: String },

    /// A model handler refused the entry.
    #[error("rejected by handler: {0}")]
    Handler(String),

    /// Any other store failure.
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for EntryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConstraintViolation { kind, detail } => {
                Self::ConstraintViolation(format!("{kind}: {detail}"))
            }
            other => Self::Store(other.to_string()),
        }
    }
}
