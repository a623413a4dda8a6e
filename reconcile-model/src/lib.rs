//! Core entity model for the reconcile engine.
//!
//! Defines the types every sync implementation declares and every engine
//! component consumes:
//! - [`EntitySchema`] - an Entity Type: identifier fields, attribute fields and
//!   their relationship kinds
//! - [`Entity`] - one Entity Instance, addressed by its [`NaturalKey`](reconcile_types::NaturalKey)
//! - [`Normalization`] - per-field rules that make benign formatting
//!   differences compare equal
//! - [`ModelHandler`] - optional per-model create/update/delete hooks
//! - [`ModelRegistry`] - the static table of Entity Types with their
//!   validated dependency order
//!
//! Schemas are plain serde structs so connectors can declare them in JSON.

mod entity;
mod error;
mod handler;
mod normalize;
mod ownership;
mod registry;
mod schema;

pub use entity::{AttrMap, Entity, EntityMeta};
pub use error::{ModelError, ModelResult};
pub use handler::ModelHandler;
pub use normalize::{Normalization, canonicalize, normalize_value};
pub use ownership::{OwnershipMarker, SourceKind};
pub use registry::{ModelEntry, ModelRegistry, RegistryBuilder};
pub use schema::{EntitySchema, FieldDef, FieldKind};
