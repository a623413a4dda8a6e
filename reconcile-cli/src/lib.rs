//! Shared pieces of the `reconcile` binary: schema loading, store opening
//! and report rendering.

use anyhow::{Context, Result};
use clap::ValueEnum;
use reconcile_model::{EntitySchema, ModelRegistry, SourceKind};
use reconcile_store::{Datastore, MemoryStore, SqliteStore};
use reconcile_sync::{RunResult, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// A schema file: the Entity Types one sync declares.
///
/// ```json
/// { "models": [ { "model_type": "site", "identifiers": [ { "name": "name" } ] } ] }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaFile {
    pub models: Vec<EntitySchema>,
}

impl SchemaFile {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse schema file")
    }

    /// Builds the registry, validating every schema and the dependency order.
    pub fn into_registry(self) -> Result<ModelRegistry> {
        self.models
            .into_iter()
            .fold(ModelRegistry::builder(), |b, schema| b.register(schema))
            .build()
            .context("Invalid model registry")
    }
}

pub fn load_registry(path: &Path) -> Result<ModelRegistry> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file {}", path.display()))?;
    SchemaFile::parse(&text)?.into_registry()
}

/// Opens the SQLite target at `path`, or an in-memory store when no path is
/// given.
pub fn open_store(path: Option<&Path>) -> Result<Arc<dyn Datastore>> {
    match path {
        Some(path) => {
            let path_str = path
                .to_str()
                .with_context(|| format!("Non-UTF-8 database path {}", path.display()))?;
            let store = SqliteStore::new(path_str)
                .with_context(|| format!("Failed to open database {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

/// `--kind` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Observes live systems; owns what it reports.
    Discovery,
    /// Curated intent; never overwrites discovered fields.
    Declarative,
}

impl From<KindArg> for SourceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Discovery => SourceKind::Discovery,
            KindArg::Declarative => SourceKind::Declarative,
        }
    }
}

/// Machine-readable summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub source: String,
    pub status: RunStatus,
    pub counts: BTreeMap<String, reconcile_sync::ModelCounts>,
    pub failures: Vec<String>,
    pub conflicts: Vec<String>,
    pub warnings: Vec<String>,
    pub abort_reason: Option<String>,
}

impl From<&RunResult> for RunSummary {
    fn from(result: &RunResult) -> Self {
        Self {
            run_id: result.run_id.to_string(),
            source: result.source.to_string(),
            status: result.status,
            counts: result.counts.clone(),
            failures: result.failures.iter().map(ToString::to_string).collect(),
            conflicts: result.conflicts.iter().map(ToString::to_string).collect(),
            warnings: result.warnings.iter().map(ToString::to_string).collect(),
            abort_reason: result.abort_reason.clone(),
        }
    }
}

/// Text report: the run summary, then the changeset when `show_diff`.
pub fn render_text(result: &RunResult, show_diff: bool) -> String {
    let mut out = result.to_string();
    if show_diff && !result.changeset.is_empty() {
        out.push('\n');
        out.push_str(&result.changeset.to_string());
    }
    out
}

pub fn render_json(result: &RunResult) -> Result<String> {
    serde_json::to_string_pretty(&RunSummary::from(result)).context("Failed to serialize run summary")
}

/// Process exit code for a finished run.
pub fn exit_code(status: RunStatus) -> u8 {
    match status {
        RunStatus::Completed | RunStatus::DryRun => 0,
        RunStatus::CompletedWithErrors => 2,
        RunStatus::Cancelled | RunStatus::Failed => 1,
    }
}
