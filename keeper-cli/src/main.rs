/*!
Keeper CLI - runs and inspects unattended backups to object storage.

`keeper run` validates the configuration and backs up on a fixed interval
until interrupted. The other subcommands run a single cycle, check the
configuration, list snapshots, or prune them on demand.
*/

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use keeper_core::observability::init_logging;
use keeper_core::{
    BackupConfig, BackupScheduler, CycleReport, LocalObjectStore, ObjectStore, PruneReport,
    RetentionPruner, ShutdownSignal, SnapshotOutcome, StoreBackend, ValidatedConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tabled::{Table, Tabled};
use tracing::{error, info};

type DynStore = Box<dyn ObjectStore + Send + Sync>;

#[derive(Parser)]
#[command(name = "keeper")]
#[command(about = "Mirror blobs and keep deduplicated snapshots in object storage")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "KEEPER_CONFIG", default_value = "keeper.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Access key, overrides the configuration file
    #[arg(long, global = true, env = "KEEPER_ACCESS_KEY", hide_env_values = true)]
    access_key: Option<String>,

    /// Secret key, overrides the configuration file
    #[arg(long, global = true, env = "KEEPER_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Bucket (or store directory for the local backend), overrides the configuration file
    #[arg(long, global = true, env = "KEEPER_BUCKET")]
    bucket: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up on the configured interval until interrupted
    Run,
    /// Run a single backup cycle
    Once,
    /// Validate the configuration and store access
    Check,
    /// List stored snapshots, oldest first
    Snapshots {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete the oldest snapshots now
    Prune {
        /// Snapshots to keep (defaults to the configured retention)
        #[arg(short, long)]
        keep: Option<usize>,
        /// Only show what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Digest")]
    digest: String,
    #[tabled(rename = "Key")]
    key: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs)?;

    let config = load_config(&cli)?;
    let store = open_store(&config)?;

    match cli.command {
        Commands::Run => run_forever(config, store)?,
        Commands::Once => run_once(config, store)?,
        Commands::Check => check(config, store)?,
        Commands::Snapshots { json } => list_snapshots(config, store, json)?,
        Commands::Prune { keep, dry_run } => prune(config, store, keep, dry_run)?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<BackupConfig, anyhow::Error> {
    let mut config = BackupConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    if let Some(bucket) = &cli.bucket {
        config.bucket = bucket.clone();
    }

    match (&cli.access_key, &cli.secret_key) {
        (Some(access_key), Some(secret_key)) => {
            config.credentials = Some(keeper_core::config::Credentials {
                access_key: access_key.clone(),
                secret_key: secret_key.clone(),
            });
        }
        (None, None) => {}
        _ => bail!("--access-key and --secret-key must be given together"),
    }

    Ok(config)
}

fn open_store(config: &BackupConfig) -> Result<DynStore, anyhow::Error> {
    match config.backend {
        StoreBackend::Local => Ok(Box::new(LocalObjectStore::new(&config.bucket))),
        StoreBackend::S3 => {
            #[cfg(feature = "s3")]
            {
                let store = keeper_core::S3ObjectStore::from_config(config)?;
                Ok(Box::new(store))
            }
            #[cfg(not(feature = "s3"))]
            {
                Err(anyhow!("S3 support not enabled"))
            }
        }
    }
}

fn start(config: BackupConfig, store: DynStore) -> Result<BackupScheduler<DynStore>, anyhow::Error> {
    BackupScheduler::start(config, store).map_err(|e| {
        error!(error = %e, "Startup validation failed");
        anyhow!(e)
    })
}

fn run_forever(config: BackupConfig, store: DynStore) -> Result<(), anyhow::Error> {
    let scheduler = start(config, store)?;
    let shutdown = Arc::new(ShutdownSignal::new());

    let worker = {
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("keeper-scheduler".to_string())
            .spawn(move || scheduler.run(&shutdown))
            .context("Failed to start scheduler thread")?
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create signal runtime")?;
    runtime.block_on(wait_for_signal())?;

    info!("Shutdown requested, waiting for the current cycle to finish");
    shutdown.trigger();
    worker
        .join()
        .map_err(|_| anyhow!("Scheduler thread panicked"))?;
    Ok(())
}

async fn wait_for_signal() -> Result<(), anyhow::Error> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn run_once(config: BackupConfig, store: DynStore) -> Result<(), anyhow::Error> {
    let scheduler = start(config, store)?;
    let report = scheduler.run_cycle();
    print_cycle(&report);

    #[cfg(feature = "metrics")]
    if let Some(metrics) = keeper_core::observability::KeeperMetrics::global() {
        tracing::debug!(metrics = %metrics.gather_metrics()?, "Metrics after cycle");
    }

    match report.error {
        Some(e) => Err(anyhow!("Backup cycle aborted: {e}")),
        None => Ok(()),
    }
}

fn check(config: BackupConfig, store: DynStore) -> Result<(), anyhow::Error> {
    let validated = ValidatedConfig::validate(config, &store)?;
    println!("✓ Configuration is valid");
    println!("  Bucket: {}", validated.config().bucket);
    println!("  Remote root: {}", validated.remote_root());
    println!("  Local root: {}", validated.local_root().display());
    for (local_dir, remote_dir) in validated.blob_mirrors() {
        let marker = if local_dir.is_dir() { "✓" } else { "✗ missing" };
        println!("  Blobs: {} -> {remote_dir} {marker}", local_dir.display());
    }
    Ok(())
}

fn list_snapshots(config: BackupConfig, store: DynStore, json: bool) -> Result<(), anyhow::Error> {
    let scheduler = start(config, store)?;
    let snapshots = RetentionPruner::new(scheduler.context()).snapshots()?;

    if json {
        let entries: Vec<serde_json::Value> = snapshots
            .iter()
            .map(|s| {
                serde_json::json!({
                    "key": s.key,
                    "timestamp": s.timestamp,
                    "created": s.created_at().map(|at| at.to_string()),
                    "digest": s.digest,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("No snapshots found");
        return Ok(());
    }

    let rows: Vec<SnapshotRow> = snapshots
        .into_iter()
        .map(|s| SnapshotRow {
            created: s
                .created_at()
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| s.timestamp.clone()),
            digest: s.digest,
            key: s.key,
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

fn prune(
    config: BackupConfig,
    store: DynStore,
    keep: Option<usize>,
    dry_run: bool,
) -> Result<(), anyhow::Error> {
    let scheduler = start(config, store)?;
    let ctx = scheduler.context();
    let keep = keep.unwrap_or(ctx.config().schedule().max_snapshots);
    let pruner = RetentionPruner::new(ctx);

    let report = if dry_run {
        pruner.plan(keep)
    } else {
        pruner.prune(keep)
    };
    print_prune(&report, keep, dry_run);

    if report.skipped_listing {
        bail!("Could not list snapshots");
    }
    if report.failed > 0 {
        bail!("{} snapshot deletions failed", report.failed);
    }
    Ok(())
}

fn print_cycle(report: &CycleReport) {
    for mirror in &report.mirrors {
        println!(
            "{}: {} copied, {} already present",
            mirror.remote_dir, mirror.stats.copied, mirror.stats.skipped
        );
    }
    match &report.snapshot {
        Some(SnapshotOutcome::Uploaded { key, .. }) => println!("Snapshot uploaded: {key}"),
        Some(SnapshotOutcome::Unchanged { digest }) => println!("Snapshot unchanged ({digest})"),
        None => {}
    }
    if let Some(prune) = &report.prune {
        println!("Pruned {} of {} snapshots", prune.deleted, prune.considered);
    }
    if let Some(error) = &report.error {
        println!("✗ Cycle aborted: {error}");
    }
    println!("Finished in {:.1}s", report.duration.as_secs_f64());
}

fn print_prune(report: &PruneReport, keep: usize, dry_run: bool) {
    let verb = if dry_run { "Would delete" } else { "Deleted" };
    for key in &report.deleted_keys {
        println!("{verb}: {key}");
    }
    println!(
        "{} snapshots found, keeping {keep}, {} {}",
        report.considered,
        report.deleted_keys.len(),
        if dry_run { "to delete" } else { "deleted" }
    );
    if report.failed > 0 {
        println!("✗ {} deletions failed", report.failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_prune_arguments() {
        let cli = Cli::try_parse_from([
            "keeper", "--config", "/etc/keeper.toml", "prune", "--keep", "10", "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/keeper.toml"));
        match cli.command {
            Commands::Prune { keep, dry_run } => {
                assert_eq!(keep, Some(10));
                assert!(dry_run);
            }
            _ => panic!("expected prune command"),
        }
    }

    #[test]
    fn test_mismatched_credentials_rejected() {
        let dir = std::env::temp_dir().join(format!("keeper-cli-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keeper.toml");
        std::fs::write(
            &path,
            "backend = \"local\"\nbucket = \"/tmp/store\"\nremote_root = \"app\"\nlocal_root = \"/tmp\"\n",
        )
        .unwrap();

        let mut cli = Cli::try_parse_from(["keeper", "check"]).unwrap();
        cli.config = path;
        cli.access_key = Some("AKIA".to_string());
        cli.secret_key = None;
        assert!(load_config(&cli).is_err());

        cli.secret_key = Some("secret".to_string());
        cli.bucket = Some("/tmp/other".to_string());
        let config = load_config(&cli).unwrap();
        assert_eq!(config.bucket, "/tmp/other");
        assert!(config.credentials.is_some());
        std::fs::remove_dir_all(&dir).ok();
    }
}
