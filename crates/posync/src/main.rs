//! posync - archive attachment sync

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use posync::checkpoint::PgCheckpointStore;
use posync::config::Config;
use posync::ingest::{archive_status, requeue, RequeueFilter, SyncOrchestrator};
use posync::storage::S3ObjectStore;
use posync_common::logging::{init_logging, LogConfig, LogLevel};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "posync")]
#[command(author, version, about = "Sync manifest-routed archive attachments from S3")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Bucket holding the archives (overrides S3_BUCKET)
    #[arg(long, global = true)]
    bucket: Option<String>,

    /// Scratch directory for downloads and extraction (overrides POSYNC_SCRATCH_DIR)
    #[arg(long, global = true)]
    scratch_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one full sweep (default)
    Run,

    /// Re-open flagged items of an archive so the next sweep retries them
    Requeue {
        archive_id: String,

        #[arg(long, value_enum, default_value_t = RequeueFilter::AllFlagged)]
        status: RequeueFilter,
    },

    /// Show the checkpoint state of an archive
    Status { archive_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("posync")
        .filter_directives("aws_smithy_runtime=warn,aws_config=warn,sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    info!("Application started");

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Fatal error, terminating");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(bucket) = cli.bucket {
        config.storage.bucket = bucket;
    }
    if let Some(dir) = cli.scratch_dir {
        config.sync.scratch_dir = dir;
    }
    config.validate()?;

    let checkpoints = Arc::new(
        PgCheckpointStore::connect(&config.database)
            .await
            .context("Failed to open checkpoint store")?,
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let objects = Arc::new(S3ObjectStore::new(&config.storage).await);
            let sync = SyncOrchestrator::new(
                objects,
                checkpoints,
                &config.storage.bucket,
                &config.sync,
            );

            let stats = sync.run().await?;
            info!(stats = %serde_json::to_string(&stats)?, "Run statistics");
        }
        Command::Requeue { archive_id, status } => {
            let reopened = requeue(checkpoints.as_ref(), &archive_id, status).await?;
            if reopened == 0 {
                warn!(archive_id = %archive_id, filter = ?status, "No matching items to requeue");
            }
        }
        Command::Status { archive_id } => {
            let status = archive_status(checkpoints.as_ref(), &archive_id).await?;
            match &status.archive {
                Some(archive) => info!(
                    archive_id = %archive_id,
                    completed = archive.completed,
                    last_updated = %archive.last_updated,
                    error = archive.error.as_deref().unwrap_or(""),
                    items = status.items,
                    open = status.open,
                    by_status = ?status.by_status,
                    "Archive status"
                ),
                None => warn!(archive_id = %archive_id, "No checkpoint for archive"),
            }
        }
    }

    Ok(())
}
