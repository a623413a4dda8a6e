//! Run results: counts, failures, conflicts and per-phase statistics.

use crate::cache::CacheStats;
use crate::changeset::{Changeset, Operation, Outcome, SyncWarning};
use crate::error::EntryError;
use chrono::{DateTime, Utc};
use reconcile_types::{NaturalKey, RunId, SourceId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Per-model-type outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelCounts {
    pub created: usize,
    /// Includes claims and recoveries.
    pub updated: usize,
    /// Includes soft deletes.
    pub deleted: usize,
    pub skipped_conflict: usize,
    pub failed: usize,
}

impl ModelCounts {
    pub(crate) fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated | Outcome::Claimed | Outcome::Recovered => self.updated += 1,
            Outcome::Deleted | Outcome::SoftDeleted => self.deleted += 1,
            Outcome::SkippedConflict => self.skipped_conflict += 1,
            Outcome::Failed(_) => self.failed += 1,
            Outcome::RolledBack => {}
        }
    }

    fn add(&mut self, other: &Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped_conflict += other.skipped_conflict;
        self.failed += other.failed;
    }
}

/// One failed changeset entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub model_type: String,
    pub key: NaturalKey,
    pub operation: Operation,
    pub error: EntryError,
}

impl fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} failed: {}", self.operation, self.model_type, self.key, self.error)
    }
}

/// An ownership conflict the run ran into. Not an error: the entry was
/// skipped or only partly applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub model_type: String,
    pub key: NaturalKey,
    pub operation: Operation,
    /// Source that owns the row, if any.
    pub owner: Option<SourceId>,
    /// Changed fields that were not written.
    pub withheld: Vec<String>,
    pub reason: String,
}

impl fmt::Display for ConflictRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}: {}", self.operation, self.model_type, self.key, self.reason)?;
        if !self.withheld.is_empty() {
            write!(f, " (withheld: {})", self.withheld.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    LoadSource,
    LoadTarget,
    Diff,
    Apply,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadSource => f.write_str("load-source"),
            Self::LoadTarget => f.write_str("load-target"),
            Self::Diff => f.write_str("diff"),
            Self::Apply => f.write_str("apply"),
        }
    }
}

/// Wall-clock time and size of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseStats {
    pub phase: Phase,
    pub duration: Duration,
    /// Entities loaded, or changeset entries diffed/applied.
    pub entities: usize,
    /// Approximate in-memory footprint of what the phase holds.
    pub estimated_bytes: usize,
}

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// No fatal error, but at least one entry failed.
    CompletedWithErrors,
    /// The changeset was computed and not applied.
    DryRun,
    Cancelled,
    /// Aborted after a create error with `fail_on_create_error` set.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::CompletedWithErrors => f.write_str("completed with errors"),
            Self::DryRun => f.write_str("dry run"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Per-entity log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncLogEntry {
    pub model_type: String,
    pub key: String,
    pub action: String,
    pub status: String,
    pub message: String,
    /// Rendered field diff.
    pub diff: String,
}

/// Everything a run did.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: RunId,
    pub source: SourceId,
    pub status: RunStatus,
    pub counts: BTreeMap<String, ModelCounts>,
    pub failures: Vec<EntryFailure>,
    pub conflicts: Vec<ConflictRecord>,
    pub warnings: Vec<SyncWarning>,
    /// Filled only when the run was started with `debug`, except that
    /// failures and conflicts are always logged.
    pub logs: Vec<SyncLogEntry>,
    pub phases: Vec<PhaseStats>,
    pub cache: CacheStats,
    /// The changeset with per-entry outcomes.
    pub changeset: Changeset,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Why the run stopped early, if it did.
    pub abort_reason: Option<String>,
}

impl RunResult {
    pub fn totals(&self) -> ModelCounts {
        let mut totals = ModelCounts::default();
        for counts in self.counts.values() {
            totals.add(counts);
        }
        totals
    }

    pub fn counts_for(&self, model_type: &str) -> ModelCounts {
        self.counts.get(model_type).copied().unwrap_or_default()
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseStats> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::DryRun)
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.totals();
        writeln!(f, "run {} from {}: {}", self.run_id, self.source, self.status)?;
        writeln!(
            f,
            "  created {}, updated {}, deleted {}, conflicts {}, failed {}",
            t.created, t.updated, t.deleted, t.skipped_conflict, t.failed
        )?;
        for (model_type, c) in &self.counts {
            writeln!(
                f,
                "  {model_type}: +{} ~{} -{} !{} x{}",
                c.created, c.updated, c.deleted, c.skipped_conflict, c.failed
            )?;
        }
        for p in &self.phases {
            writeln!(f, "  {}: {:?} ({} entities)", p.phase, p.duration, p.entities)?;
        }
        for failure in &self.failures {
            writeln!(f, "  error: {failure}")?;
        }
        for conflict in &self.conflicts {
            writeln!(f, "  conflict: {conflict}")?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {warning}")?;
        }
        if let Some(reason) = &self.abort_reason {
            writeln!(f, "  stopped: {reason}")?;
        }
        Ok(())
    }
}
