//! tsfold CLI
//!
//! Inspect, recover and compact one partition directory:
//! - `status`: list files and their lifecycle state
//! - `recover`: run startup recovery and report what it did
//! - `compact`: run compactions once, or keep a scheduler running
//! - `config`: print the default configuration as TOML

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tsfold_core::compaction::{self, CompactionScheduler, ConsistencyValidator};
use tsfold_core::metrics::TracingMetrics;
use tsfold_core::partition::{Collaborators, PartitionConfig, PartitionStatus, StoragePartition};
use tsfold_core::registry::PartitionId;

#[derive(Parser)]
#[command(name = "tsfold")]
#[command(version = tsfold_core::VERSION)]
#[command(about = "Compaction tool for time-partitioned time-series files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data root holding the sequence/ and unsequence/ directories
    #[arg(short, long, default_value = "data", global = true)]
    root: PathBuf,

    /// Storage group of the partition
    #[arg(short = 'g', long, default_value = "root", global = true)]
    storage_group: String,

    /// Time partition number
    #[arg(short = 'p', long, default_value_t = 0, global = true)]
    time_partition: i64,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    format: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the files of the partition
    Status,

    /// Resolve interrupted compactions and reload the partition
    Recover,

    /// Run compactions
    Compact {
        /// Keep selecting until nothing is left
        #[arg(long)]
        all: bool,

        /// Check every merge against its sources before trusting it
        #[arg(long)]
        validate: bool,

        /// Keep a background scheduler running until Ctrl-C, ticking every N seconds
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },

    /// Print the default configuration
    Config,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PartitionConfig> {
    let Some(path) = path else {
        return Ok(PartitionConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: PartitionConfig =
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
    config.compaction.validate()?;
    Ok(config)
}

fn open_partition(cli: &Cli, config: PartitionConfig) -> anyhow::Result<StoragePartition> {
    let id = PartitionId::new(cli.storage_group.clone(), cli.time_partition);
    let collaborators = Collaborators {
        metrics: Arc::new(TracingMetrics),
        ..Default::default()
    };
    let partition = StoragePartition::open_with(&cli.root, id.clone(), config, collaborators)
        .with_context(|| format!("opening partition {} under {}", id, cli.root.display()))?;
    Ok(partition)
}

fn print_status(status: &PartitionStatus, format: &str) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(status)?),
        "table" => {
            println!(
                "Partition {}/{} (next version {})",
                status.storage_group, status.time_partition, status.next_version
            );
            for (space, files) in [("sequence", &status.sequence), ("unsequence", &status.unsequence)] {
                println!("\n{} ({} files)", space, files.len());
                println!(
                    "  {:<36} {:<22} {:>12} {:>8} {:>5}",
                    "FILE", "STATUS", "BYTES", "DEVICES", "PINS"
                );
                for file in files.iter() {
                    println!(
                        "  {:<36} {:<22} {:>12} {:>8} {:>5}",
                        file.name,
                        format!("{:?}", file.status),
                        file.file_size,
                        file.devices,
                        file.pins
                    );
                }
            }
            if status.pending_deletions > 0 {
                println!("\n{} file(s) waiting for readers", status.pending_deletions);
            }
        }
        other => bail!("unknown output format {:?}", other),
    }
    Ok(())
}

/// Select, claim, execute and optionally validate one plan
fn compact_one(partition: &StoragePartition, validate: bool) -> anyhow::Result<bool> {
    let Some(plan) = partition.select() else {
        return Ok(false);
    };
    compaction::claim(&plan)?;

    let validator = ConsistencyValidator::new(partition.codec());
    let expected = if validate {
        let sources: Vec<_> = plan.sources().cloned().collect();
        match validator.expected(&sources) {
            Ok(expected) => Some(expected),
            Err(e) => {
                compaction::release(&plan);
                return Err(e.into());
            }
        }
    } else {
        None
    };

    let outcome = partition.execute(&plan, &CancellationToken::new())?;
    println!(
        "{}: {} -> {} target(s), {} points, {} duplicates dropped, {:?}",
        outcome.kind,
        outcome.sources.len(),
        outcome.targets.len(),
        outcome.points_written,
        outcome.duplicates_dropped,
        outcome.duration
    );

    if let Some(expected) = expected {
        let report = validator.validate(&expected, &outcome.targets)?;
        if !report.is_consistent() {
            for defect in &report.defects {
                warn!("{}", defect);
            }
            bail!("{} defect(s) found after {}", report.defects.len(), outcome.kind);
        }
        println!(
            "  validated {} series, {} points",
            report.series_checked, report.points_checked
        );
    }
    Ok(true)
}

async fn watch(partition: StoragePartition, secs: u64) -> anyhow::Result<()> {
    let handle = CompactionScheduler::new(Arc::new(partition))
        .with_interval(Duration::from_secs(secs.max(1)))
        .start();
    handle.trigger();
    info!("Compaction scheduler running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down after {} compaction(s)", handle.completed());
    handle.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&PartitionConfig::default())?);
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let partition = open_partition(&cli, config)?;

    match cli.command {
        Commands::Status => print_status(&partition.status(), &cli.format)?,
        Commands::Recover => {
            let report = partition.recovery_report();
            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(report)?),
                _ => println!("Recovery of {}: {}", partition.id(), report),
            }
        }
        Commands::Compact {
            all,
            validate,
            watch: Some(secs),
        } => {
            if all || validate {
                warn!("--all and --validate are ignored with --watch");
            }
            watch(partition, secs).await?;
        }
        Commands::Compact {
            all,
            validate,
            watch: None,
        } => {
            let mut done = 0;
            while compact_one(&partition, validate)? {
                done += 1;
                if !all {
                    break;
                }
            }
            let purged = partition.purge_retired()?;
            if done == 0 {
                println!("Nothing to compact");
            }
            if purged > 0 {
                println!("Purged {} retired file(s)", purged);
            }
        }
        Commands::Config => {}
    }
    Ok(())
}
