//! Error types for the model layer.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while declaring schemas or building entity instances.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A schema is internally inconsistent.
    #[error("invalid schema for {model_type}: {reason}")]
    InvalidSchema { model_type: String, reason: String },

    /// Two schemas share a model-type name.
    #[error("model type registered twice: {0}")]
    DuplicateModel(String),

    /// A relationship points at a model type that is not registered.
    #[error("{model_type}.{field} references unknown model type {target}")]
    UnknownModel {
        model_type: String,
        field: String,
        target: String,
    },

    /// The Entity Type graph has no valid topological order.
    #[error("cyclic dependency between model types: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// No schema is registered under this name.
    #[error("model type not registered: {0}")]
    NotRegistered(String),

    /// A required identifier is absent, null or not usable as a key part.
    #[error("{model_type}: identifier {field} is missing or null")]
    MissingIdentifier { model_type: String, field: String },

    /// A value was supplied for a field the schema does not declare.
    #[error("{model_type}: unknown field {field}")]
    UnknownField { model_type: String, field: String },

    /// A model handler rejected an entity.
    #[error("{model_type} {key}: rejected by handler: {reason}")]
    Rejected {
        model_type: String,
        key: String,
        reason: String,
    },
}
