//! Backing store layer for the reconcile engine.
//!
//! The backing store is the durable record a sync writes into. The engine
//! talks to it only through the [`Datastore`] trait, so any system that can
//! honour the contract below can be a sync target.
//!
//! # Contract
//!
//! - Rows are unique per (model type, natural key).
//! - Relationship fields hold [`Link`]s to row ids; a link to a missing row is
//!   rejected, and a row that is still linked cannot be deleted.
//! - Updates are partial: fields absent from a [`RowPatch`] are untouched.
//! - `begin`/`commit`/`rollback` bracket a batch of writes; one transaction
//!   may be open at a time.
//!
//! Two implementations ship here: [`MemoryStore`] and the SQLite-backed
//! [`SqliteStore`].

mod error;
mod memory;
mod row;
mod sqlite;

pub use error::{ConstraintKind, StoreError, StoreResult};
pub use memory::MemoryStore;
pub use row::{FieldMap, Link, Row, RowPatch, StatusChange, StoredValue};
pub use sqlite::SqliteStore;

use reconcile_types::{NaturalKey, RecordId};

/// A transactional row store.
///
/// Calls are blocking; async callers run them on a blocking thread.
pub trait Datastore: Send + Sync {
    /// Loads every row of the given model types in one pass.
    fn list(&self, model_types: &[String]) -> StoreResult<Vec<Row>>;

    /// Fetches a row by id.
    fn get(&self, id: RecordId) -> StoreResult<Option<Row>>;

    /// Fetches a row by natural key.
    fn find_by_key(&self, model_type: &str, key: &NaturalKey) -> StoreResult<Option<Row>>;

    /// Inserts a new row.
    fn insert(&self, row: &Row) -> StoreResult<()>;

    /// Applies a partial update and returns the updated row.
    fn update(&self, id: RecordId, patch: &RowPatch) -> StoreResult<Row>;

    /// Physically removes a row.
    fn delete(&self, id: RecordId) -> StoreResult<()>;

    /// Number of rows of one model type.
    fn count(&self, model_type: &str) -> StoreResult<usize>;

    fn begin(&self) -> StoreResult<()>;

    fn commit(&self) -> StoreResult<()>;

    fn rollback(&self) -> StoreResult<()>;
}
