//! Reconcile command-line runner
//!
//! Syncs a JSON snapshot into a backing store, once, and prints what
//! changed.
//!
//! Usage:
//!   reconcile --schema models.json --snapshot inventory.json --db target.sqlite
//!
//! Without `--db` the target is an empty in-memory store, which only makes
//! sense together with `--dry-run`.

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use anyhow::{Context, Result};
use clap::Parser;
use reconcile_cli::{KindArg, exit_code, load_registry, open_store, render_json, render_text};
use reconcile_sync::{
    ActiveSource, CancelToken, DeletePolicy, RunParams, SnapshotAdapter, SyncConfig, SyncEngine,
    TransactionScope,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "reconcile")]
#[command(about = "Reconcile a backing store against a source snapshot")]
struct Args {
    /// Model schema file (JSON)
    #[arg(short, long)]
    schema: PathBuf,

    /// Source snapshot file (JSON)
    #[arg(short = 'i', long)]
    snapshot: PathBuf,

    /// SQLite database holding the target rows
    #[arg(long)]
    db: Option<PathBuf>,

    /// Name the source writes under
    #[arg(long, default_value = "snapshot")]
    source: String,

    /// How the source learns about entities
    #[arg(long, value_enum, default_value = "declarative")]
    kind: KindArg,

    /// Compute the changeset without writing
    #[arg(long)]
    dry_run: bool,

    /// What happens to target rows the source no longer reports (safe|hard)
    #[arg(long, default_value = "safe")]
    delete_policy: DeletePolicy,

    /// Only touch rows this source already owns
    #[arg(long)]
    sync_tagged_only: bool,

    /// Never create target rows
    #[arg(long)]
    no_create: bool,

    /// Never delete target rows
    #[arg(long)]
    no_delete: bool,

    /// Stop applying after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Abort on the first failed create
    #[arg(long)]
    fail_on_create_error: bool,

    /// Apply the whole run in one transaction
    #[arg(long)]
    single_transaction: bool,

    /// Record a log line for every entry
    #[arg(long)]
    debug: bool,

    /// Print the changeset after the summary
    #[arg(long)]
    show_diff: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let registry = Arc::new(load_registry(&args.schema)?);
    info!("Loaded {} model types: {}", registry.len(), registry.order().join(", "));

    let store = open_store(args.db.as_deref())?;
    if args.db.is_none() && !args.dry_run {
        warn!("No --db given; writing to an in-memory store that is discarded on exit");
    }

    let config = SyncConfig {
        fail_on_create_error: args.fail_on_create_error,
        transaction_scope: if args.single_transaction {
            TransactionScope::PerRun
        } else {
            TransactionScope::PerModelType
        },
        ..SyncConfig::default()
    };
    let engine = SyncEngine::with_config(
        registry,
        store,
        ActiveSource::new(args.source.as_str(), args.kind.into()),
        config,
    );

    let params = RunParams {
        dry_run: args.dry_run,
        delete_policy: args.delete_policy,
        debug: args.debug,
        sync_tagged_only: args.sync_tagged_only,
        skip_unmatched_source: args.no_create,
        skip_unmatched_target: args.no_delete,
        deadline: args.deadline_secs.map(Duration::from_secs),
        ..RunParams::default()
    };

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current entry");
            on_signal.cancel();
        }
    });

    let mut source = SnapshotAdapter::from_path(args.source.as_str(), args.snapshot.clone());
    let result = engine
        .run_with_cancel(&mut source, params, cancel)
        .await
        .with_context(|| format!("Sync from {} failed", args.snapshot.display()))?;

    if args.json {
        println!("{}", render_json(&result)?);
    } else {
        print!("{}", render_text(&result, args.show_diff));
    }
    if args.debug {
        for log in &result.logs {
            info!("{} {} {}: {} {}", log.action, log.model_type, log.key, log.status, log.message);
        }
    }

    Ok(ExitCode::from(exit_code(result.status)))
}
