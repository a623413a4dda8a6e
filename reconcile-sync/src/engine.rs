//! Sync engine: one load → diff → apply run.
//!
//! The engine owns no state between runs except through the backing store.
//! Each run loads the source adapter it is handed, loads a fresh datastore
//! adapter for the target, diffs the two and applies the result.

use crate::adapter::{Adapter, LoadContext, ScopeFilter};
use crate::apply::{ApplyAbort, ApplyEngine, ApplyReport};
use crate::cancel::CancelToken;
use crate::changeset::Changeset;
use crate::datastore_adapter::DatastoreAdapter;
use crate::diff::{DiffEngine, DiffOptions};
use crate::error::{Side, SyncError, SyncResult};
use crate::policy::{ActiveSource, DeletePolicy};
use crate::report::{Phase, PhaseStats, RunResult, RunStatus, SyncLogEntry};
use chrono::Utc;
use reconcile_model::ModelRegistry;
use reconcile_store::Datastore;
use reconcile_types::RunId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How writes are grouped into store transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionScope {
    /// One transaction per model type's batch of entries.
    #[default]
    PerModelType,
    /// One transaction for the whole run.
    PerRun,
}

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Status written to a row by a safe delete.
    pub soft_delete_status: String,
    /// Tag attached to a row by a safe delete.
    pub soft_delete_tag: String,
    pub transaction_scope: TransactionScope,
    /// Stop the run, rolling back the open batch, on the first failed create.
    pub fail_on_create_error: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            soft_delete_status: "deprecated".to_string(),
            soft_delete_tag: "marked-for-deletion".to_string(),
            transaction_scope: TransactionScope::PerModelType,
            fail_on_create_error: false,
        }
    }
}

/// Per-run parameters supplied by whatever triggers the run.
#[derive(Debug, Clone, Default)]
pub struct RunParams {
    /// Compute the changeset but write nothing.
    pub dry_run: bool,
    pub delete_policy: DeletePolicy,
    /// Collect a log line for every entry.
    pub debug: bool,
    /// Restricts which natural keys either side loads.
    pub scope_filter: Option<ScopeFilter>,
    /// Load only target rows already owned by the active source.
    pub sync_tagged_only: bool,
    /// Never create target rows.
    pub skip_unmatched_source: bool,
    /// Never delete target rows.
    pub skip_unmatched_target: bool,
    /// Stop applying once this much time has passed since the run started.
    pub deadline: Option<Duration>,
}

/// Runs syncs from one source into one backing store.
pub struct SyncEngine {
    registry: Arc<ModelRegistry>,
    store: Arc<dyn Datastore>,
    source: ActiveSource,
    config: SyncConfig,
}

impl SyncEngine {
    /// Creates an engine with the default `SyncConfig`.
    pub fn new(registry: Arc<ModelRegistry>, store: Arc<dyn Datastore>, source: ActiveSource) -> Self {
        Self::with_config(registry, store, source, SyncConfig::default())
    }

    pub fn with_config(
        registry: Arc<ModelRegistry>,
        store: Arc<dyn Datastore>,
        source: ActiveSource,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            store,
            source,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn source(&self) -> &ActiveSource {
        &self.source
    }

    pub async fn run(&self, source: &mut dyn Adapter, params: RunParams) -> SyncResult<RunResult> {
        self.run_with_cancel(source, params, CancelToken::new()).await
    }

    /// Runs once. `cancel` is honoured while loading and between changeset
    /// entries.
    ///
    /// Returns `Err` only for fatal errors (a side failed to load), in which
    /// case nothing was written. Everything else, including per-entry
    /// failures and cancellation, is reported in the `RunResult`.
    pub async fn run_with_cancel(
        &self,
        source: &mut dyn Adapter,
        params: RunParams,
        cancel: CancelToken,
    ) -> SyncResult<RunResult> {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let deadline = params.deadline.map(|d| Instant::now() + d);
        info!("Starting run {run_id} from {} ({})", self.source.id, source.name());

        let ctx = LoadContext::new(Arc::clone(&self.registry))
            .with_scope(params.scope_filter.clone())
            .with_cancel(cancel.clone());
        let mut phases = Vec::with_capacity(4);

        let t = Instant::now();
        source
            .load(&ctx)
            .await
            .map_err(|e| SyncError::load(Side::Source, e))?;
        phases.push(PhaseStats {
            phase: Phase::LoadSource,
            duration: t.elapsed(),
            entities: source.index().len(),
            estimated_bytes: source.index().estimated_size(),
        });

        let t = Instant::now();
        let mut target = DatastoreAdapter::new("datastore", Arc::clone(&self.store), self.config.clone());
        let target_ctx = ctx
            .clone()
            .owned_by(params.sync_tagged_only.then(|| self.source.id.clone()));
        target
            .load(&target_ctx)
            .await
            .map_err(|e| SyncError::load(Side::Target, e))?;
        phases.push(PhaseStats {
            phase: Phase::LoadTarget,
            duration: t.elapsed(),
            entities: target.index().len(),
            estimated_bytes: target.index().estimated_size(),
        });

        let t = Instant::now();
        let options = DiffOptions {
            skip_unmatched_source: params.skip_unmatched_source,
            skip_unmatched_target: params.skip_unmatched_target,
            skip_soft_deleted_targets: params.delete_policy == DeletePolicy::Safe,
            claim_unowned: true,
        };
        let changeset = DiffEngine::new(&self.registry, options).diff(source.index(), target.index());
        phases.push(PhaseStats {
            phase: Phase::Diff,
            duration: t.elapsed(),
            entities: changeset.len(),
            estimated_bytes: changeset.estimated_size(),
        });

        let (changeset, report) = if params.dry_run {
            info!("Dry run: {} entries not applied", changeset.len());
            let report = dry_run_report(&changeset, params.debug);
            (changeset, report)
        } else {
            let t = Instant::now();
            let apply = ApplyEngine::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.store),
                target.resolver(Arc::clone(&self.registry)),
                self.source.clone(),
                self.config.clone(),
            )
            .delete_policy(params.delete_policy)
            .cancel_token(cancel)
            .deadline(deadline)
            .debug(params.debug);
            let mut changeset = changeset;
            let (changeset, report) = tokio::task::spawn_blocking(move || {
                let report = apply.apply(&mut changeset);
                (changeset, report)
            })
            .await
            .map_err(|e| SyncError::Aborted(format!("apply task failed: {e}")))?;
            phases.push(PhaseStats {
                phase: Phase::Apply,
                duration: t.elapsed(),
                entities: changeset.iter().filter(|e| e.outcome().is_some()).count(),
                estimated_bytes: 0,
            });
            (changeset, report)
        };

        let cache = target.cache_stats();
        target.invalidate_cache();

        let status = match (&report.abort, params.dry_run) {
            (_, true) => RunStatus::DryRun,
            (Some(ApplyAbort::Cancelled(_)), _) => RunStatus::Cancelled,
            (Some(ApplyAbort::Failed(_)), _) => RunStatus::Failed,
            (None, _) if !report.failures.is_empty() => RunStatus::CompletedWithErrors,
            (None, _) => RunStatus::Completed,
        };
        let abort_reason = report.abort.map(|a| match a {
            ApplyAbort::Cancelled(reason) | ApplyAbort::Failed(reason) => reason,
        });
        if status == RunStatus::CompletedWithErrors {
            warn!("Run {run_id}: {} entries failed", report.failures.len());
        }

        let result = RunResult {
            run_id,
            source: self.source.id.clone(),
            status,
            counts: report.counts,
            failures: report.failures,
            conflicts: report.conflicts,
            warnings: changeset.warnings().to_vec(),
            logs: report.logs,
            phases,
            cache,
            changeset,
            started_at,
            finished_at: Utc::now(),
            abort_reason,
        };
        let totals = result.totals();
        info!(
            "Run {run_id} {}: {} created, {} updated, {} deleted, {} conflicts, {} failed",
            result.status, totals.created, totals.updated, totals.deleted, totals.skipped_conflict, totals.failed
        );
        Ok(result)
    }
}

/// Logs planned entries without touching the store.
fn dry_run_report(changeset: &Changeset, debug: bool) -> ApplyReport {
    let mut report = ApplyReport::default();
    if debug {
        report.logs = changeset
            .iter()
            .map(|entry| SyncLogEntry {
                model_type: entry.model_type.clone(),
                key: entry.key.to_string(),
                action: entry.operation.to_string(),
                status: "planned".to_string(),
                message: String::new(),
                diff: entry.render(),
            })
            .collect();
    }
    report
}
