//! Transcribe a batch of files through the vocalis job runtime.
//!
//! Submits every file for one owner, runs the worker pool until each task
//! settles, and prints the resulting task records as JSON on stdout.
//!
//! ```text
//! vocalis-batch --owner team-a --model-size small --language en a.wav b.wav
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vocalis_core::{JobSpec, TaskId, TaskRecordView, TaskRepository};
use vocalis_db::{Database, MemoryTaskRepository, PoolConfig};
use vocalis_jobs::{CommandEngine, RecoveryPolicy, ServiceConfig, TranscriptionService};

#[derive(Parser, Debug)]
#[command(name = "vocalis-batch")]
#[command(about = "Run transcription jobs for a set of audio files")]
struct Args {
    /// Audio files to transcribe
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Owner key recorded on every task
    #[arg(long, env = "VOCALIS_OWNER", default_value = "batch")]
    owner: String,

    /// Model size: tiny, base, small, medium, large, auto
    #[arg(long, default_value = "large")]
    model_size: String,

    /// Language code passed to the engine (detected when omitted)
    #[arg(long)]
    language: Option<String>,

    /// Enable speaker diarization
    #[arg(long)]
    diarize: bool,

    /// Number of concurrent workers (overrides VOCALIS_MAX_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Per-job timeout in seconds (overrides VOCALIS_JOB_TIMEOUT_SECS)
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Persist tasks in PostgreSQL instead of memory
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Startup recovery policy when using PostgreSQL
    #[arg(long)]
    recovery: Option<RecoveryPolicy>,

    /// Status poll interval in milliseconds
    #[arg(long, default_value_t = 250)]
    poll_interval_ms: u64,
}

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors
    //   RUST_LOG    - standard env filter (default: "vocalis_jobs=info,vocalis_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vocalis_jobs=info,vocalis_db=info,vocalis_batch=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("vocalis-batch.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Stdout carries the results; logs go to stderr.
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}

async fn open_store(args: &Args) -> anyhow::Result<Arc<dyn TaskRepository>> {
    match &args.database_url {
        Some(url) => {
            let db = Database::connect_with_config(url, PoolConfig::from_env())
                .await
                .context("connecting to database")?;
            #[cfg(feature = "migrations")]
            db.migrate().await.context("running migrations")?;
            Ok(Arc::new(db.tasks))
        }
        None => Ok(Arc::new(MemoryTaskRepository::new())),
    }
}

/// Layer command-line flags over the environment configuration.
fn apply_overrides(mut config: ServiceConfig, args: &Args) -> ServiceConfig {
    if let Some(workers) = args.workers {
        config = config.with_max_workers(workers);
    }
    if let Some(secs) = args.timeout_secs {
        config = config.with_job_timeout(Duration::from_secs(secs));
    }
    if let Some(policy) = args.recovery {
        config = config.with_recovery(policy);
    }
    // Admit the whole batch at once.
    let capacity = config.queue_capacity.max(args.files.len());
    config.with_queue_capacity(capacity)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();
    let args = Args::parse();

    let config = ServiceConfig::from_env().context("reading service configuration")?;
    let config = apply_overrides(config, &args);

    let store = open_store(&args).await?;
    let service = TranscriptionService::start(config, store, Arc::new(CommandEngine::from_env()))
        .await
        .context("starting transcription service")?;

    let report = service.recovery_report();
    if report.failed > 0 || report.requeued > 0 {
        info!(
            failed = report.failed,
            requeued = report.requeued,
            "Recovered tasks from a previous run"
        );
    }

    let mut ids: Vec<TaskId> = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let mut spec = JobSpec::new(file.to_string_lossy())
            .with_model_size(args.model_size.clone())
            .with_diarization(args.diarize);
        if let Some(ref language) = args.language {
            spec = spec.with_language(language.clone());
        }
        match service.submit(&args.owner, spec).await {
            Ok(id) => ids.push(id),
            Err(e) => warn!(file = %file.display(), error = %e, "Skipping file"),
        }
    }

    let poll = Duration::from_millis(args.poll_interval_ms.max(10));
    let mut results: Vec<TaskRecordView> = Vec::with_capacity(ids.len());
    for id in ids {
        loop {
            let view = service.get_status(id, &args.owner).await?;
            if view.status.is_terminal() {
                results.push(view);
                break;
            }
            tokio::time::sleep(poll).await;
        }
    }

    service.shutdown().await;

    let stats = service.stats(Some(&args.owner)).await?;
    info!(
        total = stats.total,
        completed = stats.completed,
        failed = stats.failed,
        "Batch finished"
    );

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
