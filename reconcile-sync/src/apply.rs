//! Apply engine.
//!
//! Walks a [`Changeset`] in order and writes each entry to the backing
//! store. A failing entry is recorded against that entry and the walk moves
//! on; only cancellation, a deadline, or `fail_on_create_error` stop it
//! early. Writes are grouped into transactions per model type (or per run),
//! and a batch interrupted before its commit is rolled back whole.
//!
//! All store calls are blocking. The sync engine runs `apply` on a blocking
//! thread.

use crate::cancel::{CancelToken, Interrupt};
use crate::changeset::{Changeset, ChangesetEntry, Operation, Outcome};
use crate::engine::{SyncConfig, TransactionScope};
use crate::error::EntryError;
use crate::policy::{ActiveSource, DeletePolicy, UpdateDecision, decide_update, may_delete};
use crate::report::{ConflictRecord, EntryFailure, ModelCounts, SyncLogEntry};
use crate::resolver::Resolver;
use reconcile_model::{AttrMap, EntitySchema, ModelHandler, ModelRegistry, OwnershipMarker};
use reconcile_store::{Datastore, FieldMap, Row, RowPatch, StatusChange, StoredValue};
use reconcile_types::NaturalKey;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Why an apply stopped before the end of the changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyAbort {
    /// Cancelled or out of time.
    Cancelled(String),
    /// A create failed with `fail_on_create_error` set, or a transaction
    /// could not be opened or committed.
    Failed(String),
}

/// What an apply did, derived from the entries' final outcomes.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub counts: BTreeMap<String, ModelCounts>,
    pub failures: Vec<EntryFailure>,
    pub conflicts: Vec<ConflictRecord>,
    pub logs: Vec<SyncLogEntry>,
    pub abort: Option<ApplyAbort>,
}

/// Result of applying one entry.
struct Applied {
    outcome: Outcome,
    conflict: Option<ConflictRecord>,
}

impl Applied {
    fn done(outcome: Outcome) -> Self {
        Self {
            outcome,
            conflict: None,
        }
    }

    fn conflict(entry: &ChangesetEntry, owner: Option<&OwnershipMarker>, reason: String) -> Self {
        Self {
            outcome: Outcome::SkippedConflict,
            conflict: Some(ConflictRecord {
                model_type: entry.model_type.clone(),
                key: entry.key.clone(),
                operation: entry.operation,
                owner: owner.map(|o| o.source.clone()),
                withheld: Vec::new(),
                reason,
            }),
        }
    }
}

/// The open transaction and the writes made inside it.
#[derive(Default)]
struct Batch {
    open: bool,
    start: usize,
    model_type: String,
    /// Keys whose cached lookups changed inside the batch.
    touched: Vec<(String, NaturalKey)>,
}

pub struct ApplyEngine {
    registry: Arc<ModelRegistry>,
    store: Arc<dyn Datastore>,
    resolver: Resolver,
    active: ActiveSource,
    config: SyncConfig,
    policy: DeletePolicy,
    interrupt: Interrupt,
    debug: bool,
}

impl ApplyEngine {
    pub fn new(
        registry: Arc<ModelRegistry>,
        store: Arc<dyn Datastore>,
        resolver: Resolver,
        active: ActiveSource,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            store,
            resolver,
            active,
            config,
            policy: DeletePolicy::default(),
            interrupt: Interrupt::default(),
            debug: false,
        }
    }

    #[must_use]
    pub fn delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.interrupt.token = token;
        self
    }

    #[must_use]
    pub fn deadline(mut self, deadline: Option<Instant>) -> Self {
        self.interrupt.deadline = deadline;
        self
    }

    /// Log every entry, not only failures and conflicts.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Applies `changeset` in order, marking each entry with its outcome.
    pub fn apply(&self, changeset: &mut Changeset) -> ApplyReport {
        let mut conflicts = Vec::new();
        let mut abort = None;
        let mut batch = Batch::default();
        let entries = changeset.entries_mut();

        for i in 0..entries.len() {
            // Checked between entries only; an entry is never half-written.
            if let Some(reason) = self.interrupt.check() {
                info!("Apply stopped at entry {i}: {reason}");
                self.rollback(entries, &mut batch);
                abort = Some(ApplyAbort::Cancelled(reason.to_string()));
                break;
            }

            let switch_batch = batch.open
                && self.config.transaction_scope == TransactionScope::PerModelType
                && batch.model_type != entries[i].model_type;
            if switch_batch {
                if let Err(reason) = self.commit(entries, &mut batch) {
                    abort = Some(ApplyAbort::Failed(reason));
                    break;
                }
            }
            if !batch.open {
                if let Err(e) = self.store.begin() {
                    abort = Some(ApplyAbort::Failed(format!("could not open transaction: {e}")));
                    break;
                }
                batch = Batch {
                    open: true,
                    start: i,
                    model_type: entries[i].model_type.clone(),
                    touched: Vec::new(),
                };
            }

            let entry = &mut entries[i];
            let outcome = match self.apply_entry(entry, &mut batch.touched) {
                Ok(applied) => {
                    conflicts.extend(applied.conflict);
                    applied.outcome
                }
                Err(error) => Outcome::Failed(error),
            };
            debug!("{} {} {}: {}", entry.operation, entry.model_type, entry.key, outcome);
            let create_failed = entry.operation == Operation::Create && outcome.is_failure();
            entry.mark(outcome);

            if create_failed && self.config.fail_on_create_error {
                let reason = format!("create of {} {} failed", entry.model_type, entry.key);
                warn!("{reason}; rolling back");
                self.rollback(entries, &mut batch);
                abort = Some(ApplyAbort::Failed(reason));
                break;
            }
        }

        if batch.open && abort.is_none() {
            if let Err(reason) = self.commit(entries, &mut batch) {
                abort = Some(ApplyAbort::Failed(reason));
            }
        }

        self.report(changeset, conflicts, abort)
    }

    fn commit(&self, entries: &mut [ChangesetEntry], batch: &mut Batch) -> Result<(), String> {
        match self.store.commit() {
            Ok(()) => {
                debug!("committed {} batch", batch.model_type);
                *batch = Batch::default();
                Ok(())
            }
            Err(e) => {
                let reason = format!("commit of {} batch failed: {e}", batch.model_type);
                warn!("{reason}");
                self.rollback(entries, batch);
                Err(reason)
            }
        }
    }

    /// Undoes the open batch, if any, and marks its applied entries.
    fn rollback(&self, entries: &mut [ChangesetEntry], batch: &mut Batch) {
        if !batch.open {
            return;
        }
        if let Err(e) = self.store.rollback() {
            warn!("rollback of {} batch failed: {e}", batch.model_type);
        }
        for entry in &mut entries[batch.start..] {
            entry.mark_rolled_back();
        }
        for (model_type, key) in &batch.touched {
            self.resolver.evict(model_type, key);
        }
        *batch = Batch::default();
    }

    fn apply_entry(
        &self,
        entry: &ChangesetEntry,
        touched: &mut Vec<(String, NaturalKey)>,
    ) -> Result<Applied, EntryError> {
        let schema = self
            .registry
            .schema(&entry.model_type)
            .ok_or_else(|| EntryError::Store(format!("unregistered model type {}", entry.model_type)))?;
        let handler = self.registry.handler(&entry.model_type).map(Arc::as_ref);
        match entry.operation {
            Operation::Create => self.create(schema, handler, entry, touched),
            Operation::Update => self.update(schema, handler, entry),
            Operation::Delete => self.delete(handler, entry, touched),
        }
    }

    fn create(
        &self,
        schema: &EntitySchema,
        handler: Option<&dyn ModelHandler>,
        entry: &ChangesetEntry,
        touched: &mut Vec<(String, NaturalKey)>,
    ) -> Result<Applied, EntryError> {
        let source = entry.source_entity();
        let mut fields = entry.identifiers.clone();
        fields.extend(entry.new.clone());
        if let Some(h) = handler {
            h.validate(&source).map_err(EntryError::Handler)?;
            h.before_create(&source, &mut fields).map_err(EntryError::Handler)?;
        }
        let resolved = self.resolver.resolve_all(schema, &fields)?;

        // A row the load filtered out (scope, sync_tagged_only) may still hold
        // the key. Never create a duplicate of it.
        let existing = match self.resolver.lookup_loaded(&entry.model_type, &entry.key) {
            Some(id) => self.store.get(id)?,
            None => None,
        };
        if let Some(row) = existing {
            let outcome = match &row.owner {
                None => Outcome::Claimed,
                Some(owner) if owner.is_owned_by(&self.active.id) => Outcome::Updated,
                Some(owner) => {
                    let reason = format!("row already exists, owned by {}", owner.source);
                    return Ok(Applied::conflict(entry, Some(owner), reason));
                }
            };
            let mut patch = RowPatch {
                fields: resolved,
                owner: Some(self.active.marker()),
                ..RowPatch::default()
            };
            let soft_deleted = row.status.as_deref() == Some(self.config.soft_delete_status.as_str())
                && row.tags.contains(&self.config.soft_delete_tag);
            let outcome = if soft_deleted && schema.auto_recover {
                patch.status = Some(StatusChange::Restore {
                    soft_status: self.config.soft_delete_status.clone(),
                });
                patch.remove_tags.insert(self.config.soft_delete_tag.clone());
                match outcome {
                    Outcome::Updated => Outcome::Recovered,
                    other => other,
                }
            } else {
                if soft_deleted {
                    warn!(
                        "{} {}: soft-deleted row re-observed, recovery disabled for this type",
                        entry.model_type, entry.key
                    );
                }
                outcome
            };
            self.store.update(row.id, &patch)?;
            return Ok(Applied::done(outcome));
        }

        let row = Row::new(&entry.model_type, entry.key.clone(), resolved).with_owner(self.active.marker());
        self.store.insert(&row)?;
        self.resolver.register(&entry.model_type, entry.key.clone(), row.id);
        touched.push((entry.model_type.clone(), entry.key.clone()));
        Ok(Applied::done(Outcome::Created))
    }

    fn update(
        &self,
        schema: &EntitySchema,
        handler: Option<&dyn ModelHandler>,
        entry: &ChangesetEntry,
    ) -> Result<Applied, EntryError> {
        let id = entry
            .record_id
            .ok_or_else(|| EntryError::Store(format!("no target row for {} {}", entry.model_type, entry.key)))?;
        if let Some(h) = handler {
            h.validate(&entry.source_entity()).map_err(EntryError::Handler)?;
        }

        let owner = entry.target_owner.as_ref();
        let changed = entry.new.keys().map(String::as_str);
        let (mut changes, withheld, take_over) = match decide_update(schema, owner, &self.active, changed) {
            UpdateDecision::Apply => (entry.new.clone(), Vec::new(), true),
            UpdateDecision::Partial { allowed, withheld } => {
                let changes: AttrMap = entry
                    .new
                    .iter()
                    .filter(|(name, _)| allowed.contains(name))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (changes, withheld, false)
            }
            UpdateDecision::Conflict => {
                let reason = match owner {
                    Some(o) => format!("owned by {}", o.source),
                    None => "owned by another source".to_string(),
                };
                let mut applied = Applied::conflict(entry, owner, reason);
                if let Some(c) = applied.conflict.as_mut() {
                    c.withheld = entry.new.keys().cloned().collect();
                }
                return Ok(applied);
            }
        };

        if let Some(h) = handler {
            h.before_update(&entry.key, &mut changes).map_err(EntryError::Handler)?;
        }
        let mut context = entry.identifiers.clone();
        context.extend(entry.new.clone());
        let fields = self.resolve_changes(schema, &changes, &context)?;

        let recover = entry.recover && take_over;
        let mut patch = RowPatch::fields(fields);
        if take_over {
            patch.owner = Some(self.active.marker());
        }
        if recover {
            patch.status = Some(StatusChange::Restore {
                soft_status: self.config.soft_delete_status.clone(),
            });
            patch.remove_tags.insert(self.config.soft_delete_tag.clone());
        }
        if !patch.is_empty() {
            self.store.update(id, &patch)?;
        }

        let outcome = if entry.claim && take_over {
            Outcome::Claimed
        } else if recover {
            Outcome::Recovered
        } else {
            Outcome::Updated
        };
        let conflict = (!withheld.is_empty()).then(|| ConflictRecord {
            model_type: entry.model_type.clone(),
            key: entry.key.clone(),
            operation: Operation::Update,
            owner: owner.map(|o| o.source.clone()),
            withheld,
            reason: "fields held by the owning source were not written".into(),
        });
        Ok(Applied { outcome, conflict })
    }

    /// Resolves `changes`, reading polymorphic discriminators from `context`.
    fn resolve_changes(
        &self,
        schema: &EntitySchema,
        changes: &AttrMap,
        context: &AttrMap,
    ) -> Result<FieldMap, EntryError> {
        changes
            .iter()
            .map(|(name, value)| {
                let stored = match schema.field(name) {
                    Some(def) => self.resolver.resolve_field(def, value, context)?,
                    None => StoredValue::Plain(value.clone()),
                };
                Ok((name.clone(), stored))
            })
            .collect()
    }

    fn delete(
        &self,
        handler: Option<&dyn ModelHandler>,
        entry: &ChangesetEntry,
        touched: &mut Vec<(String, NaturalKey)>,
    ) -> Result<Applied, EntryError> {
        let id = entry
            .record_id
            .ok_or_else(|| EntryError::Store(format!("no target row for {} {}", entry.model_type, entry.key)))?;
        let owner = entry.target_owner.as_ref();
        if !may_delete(owner, &self.active) {
            let reason = match owner {
                Some(o) => format!("owned by {}", o.source),
                None => "owned by another source".to_string(),
            };
            return Ok(Applied::conflict(entry, owner, reason));
        }
        if handler.is_some_and(|h| !h.allow_delete(&entry.target_entity())) {
            return Ok(Applied::conflict(entry, owner, "delete vetoed by model handler".into()));
        }

        match self.policy {
            DeletePolicy::Hard => {
                self.store.delete(id)?;
                self.resolver.forget(&entry.model_type, &entry.key);
                touched.push((entry.model_type.clone(), entry.key.clone()));
                Ok(Applied::done(Outcome::Deleted))
            }
            DeletePolicy::Safe => {
                let mut patch = RowPatch {
                    status: Some(StatusChange::SoftDelete {
                        status: self.config.soft_delete_status.clone(),
                    }),
                    // An unowned row is marked, not claimed.
                    owner: owner.map(|_| self.active.marker()),
                    ..RowPatch::default()
                };
                patch.add_tags.insert(self.config.soft_delete_tag.clone());
                self.store.update(id, &patch)?;
                Ok(Applied::done(Outcome::SoftDeleted))
            }
        }
    }

    fn report(
        &self,
        changeset: &Changeset,
        conflicts: Vec<ConflictRecord>,
        abort: Option<ApplyAbort>,
    ) -> ApplyReport {
        let mut report = ApplyReport {
            conflicts,
            abort,
            ..ApplyReport::default()
        };
        for entry in changeset {
            let Some(outcome) = entry.outcome() else {
                continue;
            };
            report
                .counts
                .entry(entry.model_type.clone())
                .or_default()
                .record(outcome);

            let mut message = String::new();
            if let Outcome::Failed(error) = outcome {
                report.failures.push(EntryFailure {
                    model_type: entry.model_type.clone(),
                    key: entry.key.clone(),
                    operation: entry.operation,
                    error: error.clone(),
                });
                message = error.to_string();
            }
            if let Some(c) = report
                .conflicts
                .iter()
                .find(|c| c.model_type == entry.model_type && c.key == entry.key)
            {
                message = c.to_string();
            }
            let noteworthy = outcome.is_failure() || !message.is_empty();
            if self.debug || noteworthy {
                report.logs.push(SyncLogEntry {
                    model_type: entry.model_type.clone(),
                    key: entry.key.to_string(),
                    action: entry.operation.to_string(),
                    status: outcome.to_string(),
                    message,
                    diff: entry.render(),
                });
            }
        }
        report
    }
}
