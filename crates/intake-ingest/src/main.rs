//! Intake Ingest - CSV subject ingestion tool

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use intake_common::logging::{init_logging, LogConfig, LogLevel};
use intake_ingest::config::IngestConfig;
use intake_ingest::db;
use intake_ingest::ingest::{
    CompletionNotifier, CompletionReporter, FileArrivalEvent, IngestionPipeline, JobRunner,
    LogNotifier, PgSubjectStore, WebhookNotifier,
};
use intake_ingest::storage::{LocalSource, ObjectLocation, ObjectSource, S3Source};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "intake-ingest")]
#[command(author, version, about = "Stream CSV subject files into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a single object
    Run {
        /// Bucket holding the object
        #[arg(short, long)]
        bucket: String,

        /// Object key
        #[arg(short, long)]
        key: String,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Ingest every object named in an event file
    Event {
        /// JSON event, plain or bucket notification form
        #[arg(short, long)]
        file: PathBuf,

        #[command(flatten)]
        job: JobArgs,
    },

    /// Apply database migrations
    Migrate,
}

#[derive(Args, Debug)]
struct JobArgs {
    /// Read objects from <DIR>/<bucket>/<key> instead of S3
    #[arg(long)]
    local_root: Option<PathBuf>,

    /// Parser worker count
    #[arg(long)]
    workers: Option<usize>,

    /// Records per upsert transaction
    #[arg(long)]
    batch_size: Option<usize>,

    /// Stop reading after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("intake-ingest")
        .build()
        .merge_env()?;

    init_logging(&log_config)?;

    let mut config = IngestConfig::load().context("Failed to load configuration")?;

    let (event, job) = match cli.command {
        Command::Migrate => {
            let pool = db::create_pool(&config.database).await?;
            db::migrate(&pool).await?;
            return Ok(());
        },
        Command::Run { bucket, key, job } => {
            (FileArrivalEvent::single(ObjectLocation::new(bucket, key)), job)
        },
        Command::Event { file, job } => {
            let event = FileArrivalEvent::from_file(&file)
                .with_context(|| format!("Failed to read event from {}", file.display()))?;
            (event, job)
        },
    };

    if let Some(workers) = job.workers {
        config.pipeline.workers = workers;
    }
    if let Some(batch_size) = job.batch_size {
        config.pipeline.batch_size = batch_size;
    }
    if let Some(secs) = job.timeout_secs {
        config.pipeline.timeout = Some(Duration::from_secs(secs));
    }
    config.pipeline.validate()?;

    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    db::health_check(&pool).await?;

    let source: Arc<dyn ObjectSource> = match job.local_root {
        Some(root) => {
            info!(root = %root.display(), "Reading objects from local directory");
            Arc::new(LocalSource::new(root))
        },
        None => Arc::new(S3Source::new(config.storage.clone()).await),
    };

    let notifier: Arc<dyn CompletionNotifier> = match &config.notifier.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(config.notifier.timeout_secs),
        )?),
        None => Arc::new(LogNotifier),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing queued rows");
            on_signal.cancel();
        }
    });

    let pipeline = IngestionPipeline::new(
        source,
        Arc::new(PgSubjectStore::new(pool)),
        config.pipeline.clone(),
    );
    let mut runner = JobRunner::new(pipeline, CompletionReporter::new(notifier), cancel);

    let outcome = runner.run_event(&event).await;
    runner.drain_notifications().await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.is_success() {
        bail!("{} of {} file(s) failed", outcome.failed.len(), event.files.len());
    }

    Ok(())
}
