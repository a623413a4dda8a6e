//! Reconciliation engine.
//!
//! Brings a backing store in line with an external system of record,
//! treating every entity as a typed record keyed by its natural key.
//!
//! # Architecture
//!
//! - **Adapter**: loads one side into an in-memory [`EntityIndex`]
//!   ([`SnapshotAdapter`] for JSON documents, [`DatastoreAdapter`] for the
//!   backing store)
//! - **Resolver**: turns natural-key references into row links, through a
//!   per-run [`LookupCache`]
//! - **Diff**: produces an ordered [`Changeset`] of creates, updates and
//!   deletes
//! - **Apply**: writes the changeset, honouring ownership and the delete
//!   policy
//! - **Engine**: runs load → diff → apply and reports a [`RunResult`]
//!
//! # Example
//!
//! ```
//! use reconcile_model::{EntitySchema, FieldDef, ModelRegistry, SourceKind};
//! use reconcile_store::MemoryStore;
//! use reconcile_sync::{ActiveSource, RunParams, SnapshotAdapter, SnapshotDocument, SnapshotRecord, SyncEngine};
//! use std::sync::Arc;
//!
//! let registry = ModelRegistry::builder()
//!     .register(
//!         EntitySchema::new("prefix")
//!             .identifier(FieldDef::scalar("network"))
//!             .attribute(FieldDef::scalar("role")),
//!     )
//!     .build()
//!     .unwrap();
//! let engine = SyncEngine::new(
//!     Arc::new(registry),
//!     Arc::new(MemoryStore::new()),
//!     ActiveSource::new("ipam", SourceKind::Declarative),
//! );
//! let doc = SnapshotDocument::new().record(
//!     "prefix",
//!     SnapshotRecord::default()
//!         .identifier("network", "10.0.0.0/24")
//!         .attribute("role", "access"),
//! );
//! let mut source = SnapshotAdapter::new("ipam", doc);
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! let result = rt.block_on(engine.run(&mut source, RunParams::default())).unwrap();
//! assert_eq!(result.totals().created, 1);
//! ```

mod adapter;
mod apply;
mod cache;
mod cancel;
mod changeset;
mod datastore_adapter;
mod diff;
mod engine;
mod error;
mod index;
pub mod policy;
mod report;
mod resolver;
mod snapshot;

pub use adapter::{Adapter, LoadContext, ScopeFilter};
pub use apply::{ApplyAbort, ApplyEngine, ApplyReport};
pub use cache::{CacheStats, LookupCache};
pub use cancel::CancelToken;
pub use changeset::{
    Changeset, ChangesetEntry, DiffSummary, Operation, Outcome, SyncWarning, WarningKind,
};
pub use datastore_adapter::DatastoreAdapter;
pub use diff::{DiffEngine, DiffOptions};
pub use engine::{RunParams, SyncConfig, SyncEngine, TransactionScope};
pub use error::{EntryError, LoadError, Side, SyncError, SyncResult};
pub use index::{EntityIndex, InsertOutcome};
pub use policy::{ActiveSource, DeletePolicy, UpdateDecision};
pub use report::{
    ConflictRecord, EntryFailure, ModelCounts, Phase, PhaseStats, RunResult, RunStatus,
    SyncLogEntry,
};
pub use resolver::{KeyTable, Resolver};
pub use snapshot::{SnapshotAdapter, SnapshotDocument, SnapshotRecord};
