//! Service facade wiring intake, dispatch, cancellation and history.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use vocalis_core::{
    defaults, Error, HistoryPage, JobSpec, Result, TaskId, TaskRecordView, TaskRepository,
    TaskStats, TaskStatus,
};

use crate::cancel::CancellationController;
use crate::dispatcher::{WorkerConfig, WorkerEvent, WorkerHandle, WorkerPool};
use crate::engine::TranscriptionEngine;
use crate::history::{HistoryConfig, HistoryService};
use crate::intake::IntakeGate;
use crate::queue::JobQueue;
use crate::recovery::{recover, RecoveryPolicy, RecoveryReport};
use crate::tracker::StatusTracker;

/// Full configuration of a [`TranscriptionService`].
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Maximum not-yet-started tasks.
    pub queue_capacity: usize,
    pub worker: WorkerConfig,
    pub history: HistoryConfig,
    pub recovery: RecoveryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::QUEUE_CAPACITY,
            worker: WorkerConfig::default(),
            history: HistoryConfig::default(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has an invalid value: '{}'", key, value))),
        Err(_) => Ok(None),
    }
}

impl ServiceConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `VOCALIS_QUEUE_CAPACITY` | `25` | Max not-yet-started tasks |
    /// | `VOCALIS_MAX_WORKERS` | `3` | Concurrent engine calls |
    /// | `VOCALIS_JOB_TIMEOUT_SECS` | `7200` | Hard per-job timeout |
    /// | `VOCALIS_WORKER_ENABLED` | `true` | Start workers at all |
    /// | `VOCALIS_HISTORY_DEFAULT_LIMIT` | `50` | Page size when none given |
    /// | `VOCALIS_HISTORY_MAX_LIMIT` | `200` | Largest page size |
    /// | `VOCALIS_RECOVERY_POLICY` | `fail-orphans` | Startup recovery |
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(n) = env_parse("VOCALIS_QUEUE_CAPACITY")? {
            config.queue_capacity = n;
        }
        if let Some(n) = env_parse("VOCALIS_MAX_WORKERS")? {
            config.worker.max_workers = n;
        }
        if let Some(secs) = env_parse::<u64>("VOCALIS_JOB_TIMEOUT_SECS")? {
            config.worker.job_timeout = Duration::from_secs(secs);
        }
        if let Ok(v) = std::env::var("VOCALIS_WORKER_ENABLED") {
            config.worker.enabled = v != "false" && v != "0";
        }
        if let Some(n) = env_parse("VOCALIS_HISTORY_DEFAULT_LIMIT")? {
            config.history.default_limit = n;
        }
        if let Some(n) = env_parse("VOCALIS_HISTORY_MAX_LIMIT")? {
            config.history.max_limit = n;
        }
        if let Some(policy) = env_parse("VOCALIS_RECOVERY_POLICY")? {
            config.recovery = policy;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.worker.max_workers = max;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.worker.job_timeout = timeout;
        self
    }

    pub fn with_history(mut self, default_limit: i64, max_limit: i64) -> Self {
        self.history = HistoryConfig {
            default_limit,
            max_limit,
        };
        self
    }

    pub fn with_recovery(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery = policy;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Reject zero sizes and an inconsistent history range.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".into()));
        }
        if self.worker.max_workers == 0 {
            return Err(Error::Config("worker count must be at least 1".into()));
        }
        if self.worker.job_timeout.is_zero() {
            return Err(Error::Config("job timeout must be non-zero".into()));
        }
        if self.history.max_limit < 1 {
            return Err(Error::Config("history max limit must be at least 1".into()));
        }
        if !(1..=self.history.max_limit).contains(&self.history.default_limit) {
            return Err(Error::Config(format!(
                "history default limit must be between 1 and {}",
                self.history.max_limit
            )));
        }
        Ok(())
    }
}

/// Queue and pool occupancy at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queue_depth: usize,
    pub capacity: usize,
    pub max_workers: usize,
    pub active_jobs: usize,
}

/// Submission, status, cancellation and history for transcription jobs.
pub struct TranscriptionService {
    config: ServiceConfig,
    queue: Arc<JobQueue>,
    tracker: Arc<StatusTracker>,
    intake: IntakeGate,
    canceller: CancellationController,
    history: HistoryService,
    pool: Arc<WorkerPool>,
    workers: Mutex<Option<WorkerHandle>>,
    recovery_report: RecoveryReport,
}

impl TranscriptionService {
    /// Wire the components and run startup recovery. Workers are not
    /// started; call [`start_workers`](Self::start_workers).
    pub async fn build(
        config: ServiceConfig,
        store: Arc<dyn TaskRepository>,
        engine: Arc<dyn TranscriptionEngine>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(JobQueue::new(config.queue_capacity));
        let tracker = Arc::new(StatusTracker::new(store.clone()));
        let recovery_report = recover(&tracker, &queue, config.recovery).await?;

        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            tracker.clone(),
            engine,
            config.worker.clone(),
        ));

        Ok(Self {
            intake: IntakeGate::new(queue.clone(), tracker.clone()),
            canceller: CancellationController::new(queue.clone(), tracker.clone()),
            history: HistoryService::new(store, config.history),
            config,
            queue,
            tracker,
            pool,
            workers: Mutex::new(None),
            recovery_report,
        })
    }

    /// Build and start workers in one step.
    pub async fn start(
        config: ServiceConfig,
        store: Arc<dyn TaskRepository>,
        engine: Arc<dyn TranscriptionEngine>,
    ) -> Result<Self> {
        let service = Self::build(config, store, engine).await?;
        service.start_workers()?;
        Ok(service)
    }

    /// Spawn the worker pool. Fails if it is already running.
    pub fn start_workers(&self) -> Result<()> {
        if !self.config.worker.enabled {
            info!(
                subsystem = "jobs",
                component = "service",
                "Job workers are disabled, not starting"
            );
            return Ok(());
        }
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.is_some() {
            return Err(Error::InvalidState("workers already started".into()));
        }
        *workers = Some(self.pool.start());
        Ok(())
    }

    /// Stop the pool: no new jobs are pulled, running jobs finish first.
    pub async fn shutdown(&self) {
        let handle = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            info!(
                subsystem = "jobs",
                component = "service",
                op = "shutdown",
                queue_depth = self.queue.len(),
                active_jobs = self.pool.active_jobs(),
                "Shutting down worker pool"
            );
            handle.shutdown().await;
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Outcome of the recovery pass run by [`build`](Self::build).
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery_report
    }

    pub async fn submit(&self, owner: &str, spec: JobSpec) -> Result<TaskId> {
        self.intake.submit(owner, spec).await
    }

    /// Current state of one of `owner`'s tasks.
    pub async fn get_status(&self, id: TaskId, owner: &str) -> Result<TaskRecordView> {
        let record = self.tracker.get(id).await?;
        if !record.is_owned_by(owner) {
            return Err(Error::Forbidden(format!(
                "task {} belongs to another owner",
                id
            )));
        }
        Ok(record.view())
    }

    pub async fn cancel(&self, id: TaskId, owner: &str) -> Result<TaskRecordView> {
        Ok(self.canceller.cancel(id, owner).await?.view())
    }

    pub async fn list_history(
        &self,
        owner: &str,
        status: Option<TaskStatus>,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<HistoryPage> {
        self.history.query(owner, status, limit, offset).await
    }

    pub async fn stats(&self, owner: Option<&str>) -> Result<TaskStats> {
        self.history.stats(owner).await
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queue_depth: self.queue.len(),
            capacity: self.queue.capacity(),
            max_workers: self.config.worker.max_workers,
            active_jobs: self.pool.active_jobs(),
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.pool.events()
    }
}
