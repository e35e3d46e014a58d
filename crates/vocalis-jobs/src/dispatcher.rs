//! Fixed-size worker pool that drains the job queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vocalis_core::{defaults, Error, Result, TaskId, TaskRecord, TaskStatus, Transition};

use crate::engine::{EngineRequest, TranscriptionEngine};
use crate::queue::JobQueue;
use crate::staging::{release_staged_input, release_staged_path};
use crate::tracker::{StatusTracker, UpdateOutcome};

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub max_workers: usize,
    /// Hard limit on one engine call.
    pub job_timeout: Duration,
    /// Whether to start workers at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: defaults::MAX_WORKERS,
            job_timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Set the number of workers.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Set the per-job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A worker loop started.
    WorkerStarted { worker_id: usize },
    /// A worker loop exited after shutdown.
    WorkerStopped { worker_id: usize },
    /// A task moved to `processing`.
    JobStarted { task_id: TaskId, worker_id: usize },
    /// A dequeued task had been cancelled and was discarded.
    JobSkipped { task_id: TaskId },
    /// A task completed.
    JobCompleted { task_id: TaskId, duration_ms: u64 },
    /// A task failed (engine error, panic, or timeout).
    JobFailed { task_id: TaskId, error: String },
}

/// Shared state of the worker pool.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    tracker: Arc<StatusTracker>,
    engine: Arc<dyn TranscriptionEngine>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
    active: AtomicUsize,
}

/// Handle for stopping a running pool.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Number of worker loops started.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal shutdown and wait until every worker has finished its current
    /// job and exited.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                error!(
                    subsystem = "jobs",
                    component = "dispatcher",
                    error = %e,
                    "Worker task ended abnormally"
                );
            }
        }
    }
}

/// Decrements the active-job counter when a job leaves the engine.
struct ActiveJob<'a>(&'a AtomicUsize);

impl<'a> ActiveJob<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        tracker: Arc<StatusTracker>,
        engine: Arc<dyn TranscriptionEngine>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            queue,
            tracker,
            engine,
            config,
            event_tx,
            active: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Jobs currently inside the engine.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Spawn `max_workers` worker loops.
    pub fn start(self: &Arc<Self>) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let workers = (0..self.config.max_workers)
            .map(|worker_id| {
                let pool = self.clone();
                let token = shutdown.clone();
                tokio::spawn(async move { pool.run_worker(worker_id, token).await })
            })
            .collect();

        info!(
            subsystem = "jobs",
            component = "dispatcher",
            op = "start",
            max_workers = self.config.max_workers,
            job_timeout_secs = self.config.job_timeout.as_secs(),
            engine = self.engine.name(),
            "Worker pool started"
        );

        WorkerHandle { shutdown, workers }
    }

    #[instrument(skip(self, shutdown), fields(subsystem = "jobs", component = "dispatcher"))]
    async fn run_worker(self: Arc<Self>, worker_id: usize, shutdown: CancellationToken) {
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted { worker_id });
        debug!(worker_id, "Worker started");

        while let Some(task_id) = self.queue.pop(&shutdown).await {
            self.process(worker_id, task_id, &shutdown).await;
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped { worker_id });
        info!(worker_id, "Worker stopped");
    }

    /// Apply a tracker update, retrying with capped exponential backoff while
    /// the store is unreachable.
    ///
    /// With `shutdown` given, retrying stops once it is cancelled and the last
    /// store error is returned. Without it, retrying continues until the
    /// write lands or fails for a non-transient reason.
    async fn update_with_retry<F>(
        &self,
        task_id: TaskId,
        op: &'static str,
        shutdown: Option<&CancellationToken>,
        decide: F,
    ) -> Result<UpdateOutcome>
    where
        F: Fn(&TaskRecord) -> Result<Option<Transition>>,
    {
        let mut delay = Duration::from_millis(defaults::STORE_RETRY_INITIAL_MS);
        let max_delay = Duration::from_millis(defaults::STORE_RETRY_MAX_MS);
        loop {
            match self.tracker.update(task_id, &decide).await {
                Err(e) if e.is_transient() => {
                    warn!(
                        subsystem = "jobs",
                        component = "dispatcher",
                        op,
                        task_id = %task_id,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Status write failed, retrying"
                    );
                    let stopped = match shutdown {
                        Some(token) => tokio::select! {
                            _ = token.cancelled() => true,
                            _ = tokio::time::sleep(delay) => false,
                        },
                        None => {
                            tokio::time::sleep(delay).await;
                            false
                        }
                    };
                    if stopped {
                        return Err(e);
                    }
                    delay = (delay * 2).min(max_delay);
                }
                other => return other,
            }
        }
    }

    /// Decide, execute and finalize one dequeued task.
    async fn process(&self, worker_id: usize, task_id: TaskId, shutdown: &CancellationToken) {
        let picked = self
            .update_with_retry(task_id, "pickup", Some(shutdown), |current| {
                match current.status {
                    TaskStatus::Queued => Ok(Some(Transition::Pickup)),
                    TaskStatus::Cancelled => Ok(None),
                    other => Err(Error::InvalidState(format!(
                        "dequeued task in status {}",
                        other
                    ))),
                }
            })
            .await;

        let record = match picked {
            Ok(UpdateOutcome::Applied(record)) => record,
            Ok(UpdateOutcome::Unchanged(record)) => {
                debug!(
                    subsystem = "jobs",
                    component = "dispatcher",
                    op = "skip",
                    task_id = %task_id,
                    worker_id,
                    "Skipping cancelled task"
                );
                release_staged_input(&record).await;
                let _ = self.event_tx.send(WorkerEvent::JobSkipped { task_id });
                return;
            }
            Err(e) => {
                // Only reached on shutdown or a non-transient error; the
                // record stays `queued` in the store for restart recovery.
                error!(
                    subsystem = "jobs",
                    component = "dispatcher",
                    op = "pickup",
                    task_id = %task_id,
                    worker_id,
                    error = %e,
                    "Failed to start task"
                );
                return;
            }
        };

        info!(
            subsystem = "jobs",
            component = "dispatcher",
            op = "pickup",
            task_id = %task_id,
            worker_id,
            model_size = %record.model_size,
            "Processing task"
        );
        let _ = self
            .event_tx
            .send(WorkerEvent::JobStarted { task_id, worker_id });

        let start = Instant::now();
        let (outcome, input_in_use) = self.execute(&record).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        self.finalize(record, outcome, duration_ms, input_in_use).await;
    }

    /// Run the engine on the blocking pool, bounded by the job timeout.
    ///
    /// The flag is set when the engine call outlived the timeout and may
    /// still be reading its input. A staged input is then released once that
    /// call returns.
    async fn execute(&self, record: &TaskRecord) -> (Transition, bool) {
        let _active = ActiveJob::enter(&self.active);
        let engine = self.engine.clone();
        let request = EngineRequest::from(record);
        let timeout = self.config.job_timeout;

        let mut call = tokio::task::spawn_blocking(move || engine.transcribe(&request));
        match tokio::time::timeout(timeout, &mut call).await {
            Ok(Ok(Ok(result))) => (Transition::Complete(result), false),
            Ok(Ok(Err(e))) => (Transition::Fail(e.into_failure_message()), false),
            Ok(Err(join_error)) => (
                Transition::Fail(
                    Error::Execution(format!("engine panicked: {}", join_error)).to_string(),
                ),
                false,
            ),
            Err(_) => {
                if record.staged {
                    let path = record.input_path.clone();
                    tokio::spawn(async move {
                        let _ = call.await;
                        release_staged_path(&path).await;
                    });
                }
                (Transition::Fail(Error::Timeout(timeout).to_string()), true)
            }
        }
    }

    async fn finalize(
        &self,
        record: TaskRecord,
        outcome: Transition,
        duration_ms: u64,
        input_in_use: bool,
    ) {
        let task_id = record.id;
        // Retries through shutdown: a task must not stay `processing`.
        let finished = self
            .update_with_retry(task_id, "finalize", None, |current| {
                if current.status == TaskStatus::Processing {
                    Ok(Some(outcome.clone()))
                } else {
                    Err(Error::InvalidState(format!(
                        "finished task in status {}",
                        current.status
                    )))
                }
            })
            .await;

        match finished {
            Ok(outcome) => {
                let finished = outcome.into_record();
                match finished.status {
                    TaskStatus::Completed => {
                        info!(
                            subsystem = "jobs",
                            component = "dispatcher",
                            op = "finalize",
                            task_id = %task_id,
                            status = %finished.status,
                            duration_ms,
                            "Task completed"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                            task_id,
                            duration_ms,
                        });
                    }
                    _ => {
                        let error = finished.error_message.clone().unwrap_or_default();
                        warn!(
                            subsystem = "jobs",
                            component = "dispatcher",
                            op = "finalize",
                            task_id = %task_id,
                            status = %finished.status,
                            duration_ms,
                            error = %error,
                            "Task failed"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobFailed { task_id, error });
                    }
                }
            }
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "dispatcher",
                    op = "finalize",
                    task_id = %task_id,
                    error = %e,
                    "Failed to record task outcome"
                );
            }
        }

        if !input_in_use {
            release_staged_input(&record).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NoOpEngine;
    use chrono::Utc;
    use vocalis_core::{JobSpec, TaskRepository};
    use vocalis_db::MemoryTaskRepository;

    struct FailingEngine;

    impl TranscriptionEngine for FailingEngine {
        fn transcribe(&self, _request: &EngineRequest) -> Result<serde_json::Value> {
            Err(Error::Execution("unsupported codec".into()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct PanickingEngine;

    impl TranscriptionEngine for PanickingEngine {
        fn transcribe(&self, _request: &EngineRequest) -> Result<serde_json::Value> {
            panic!("decoder state corrupted")
        }

        fn name(&self) -> &str {
            "panicking"
        }
    }

    /// Takes the store offline for `outage` just as the engine returns.
    struct OutageEngine {
        store: Arc<MemoryTaskRepository>,
        outage: Duration,
    }

    impl TranscriptionEngine for OutageEngine {
        fn transcribe(&self, _request: &EngineRequest) -> Result<serde_json::Value> {
            self.store.set_unavailable(true);
            let store = self.store.clone();
            let outage = self.outage;
            std::thread::spawn(move || {
                std::thread::sleep(outage);
                store.set_unavailable(false);
            });
            Ok(serde_json::json!({ "text": "done" }))
        }

        fn name(&self) -> &str {
            "outage"
        }
    }

    /// Blocks until the test sends on (or drops) the paired sender.
    struct BlockingEngine {
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl TranscriptionEngine for BlockingEngine {
        fn transcribe(&self, _request: &EngineRequest) -> Result<serde_json::Value> {
            let release = self.release.lock().unwrap();
            let _ = release.recv_timeout(Duration::from_secs(10));
            Ok(serde_json::json!({ "text": "late" }))
        }

        fn name(&self) -> &str {
            "blocking"
        }
    }

    struct Fixture {
        pool: Arc<WorkerPool>,
        queue: Arc<JobQueue>,
        tracker: Arc<StatusTracker>,
        store: Arc<MemoryTaskRepository>,
    }

    fn fixture(engine: Arc<dyn TranscriptionEngine>, config: WorkerConfig) -> Fixture {
        fixture_on(Arc::new(MemoryTaskRepository::new()), engine, config)
    }

    fn fixture_on(
        store: Arc<MemoryTaskRepository>,
        engine: Arc<dyn TranscriptionEngine>,
        config: WorkerConfig,
    ) -> Fixture {
        let queue = Arc::new(JobQueue::new(10));
        let tracker = Arc::new(StatusTracker::new(store.clone()));
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            tracker.clone(),
            engine,
            config,
        ));
        Fixture {
            pool,
            queue,
            tracker,
            store,
        }
    }

    async fn enqueue(fixture: &Fixture) -> TaskId {
        enqueue_spec(fixture, JobSpec::new("/audio/x.wav")).await
    }

    async fn enqueue_spec(fixture: &Fixture, spec: JobSpec) -> TaskId {
        let job = spec.validate("k").unwrap();
        let record = TaskRecord::new_queued(job, Utc::now());
        let id = record.id;
        let reservation = fixture.queue.try_reserve().unwrap();
        fixture.tracker.insert(record).await.unwrap();
        reservation.commit(id);
        id
    }

    async fn next_terminal(events: &mut broadcast::Receiver<WorkerEvent>) -> WorkerEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event within timeout")
                .expect("channel open");
            match event {
                WorkerEvent::JobCompleted { .. }
                | WorkerEvent::JobFailed { .. }
                | WorkerEvent::JobSkipped { .. } => return event,
                _ => {}
            }
        }
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.job_timeout, Duration::from_secs(7200));
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_max_workers(8)
            .with_job_timeout(Duration::from_millis(50))
            .with_enabled(false);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.job_timeout, Duration::from_millis(50));
        assert!(!config.enabled);
    }

    #[tokio::test]
    async fn test_completes_task() {
        let f = fixture(Arc::new(NoOpEngine), WorkerConfig::default().with_max_workers(1));
        let mut events = f.pool.events();
        let handle = f.pool.start();
        let id = enqueue(&f).await;

        assert!(matches!(
            next_terminal(&mut events).await,
            WorkerEvent::JobCompleted { task_id, .. } if task_id == id
        ));
        let record = f.tracker.get(id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_some());
        assert_eq!(f.pool.active_jobs(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_error_fails_task() {
        let f = fixture(Arc::new(FailingEngine), WorkerConfig::default().with_max_workers(1));
        let mut events = f.pool.events();
        let handle = f.pool.start();
        let id = enqueue(&f).await;

        match next_terminal(&mut events).await {
            WorkerEvent::JobFailed { task_id, error } => {
                assert_eq!(task_id, id);
                assert_eq!(error, "execution error: unsupported codec");
            }
            other => panic!("unexpected event {:?}", other),
        }
        let record = f.tracker.get(id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.result.is_none());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_panic_fails_task_and_worker_survives() {
        let f = fixture(Arc::new(PanickingEngine), WorkerConfig::default().with_max_workers(1));
        let mut events = f.pool.events();
        let handle = f.pool.start();

        let first = enqueue(&f).await;
        let second = enqueue(&f).await;
        for expected in [first, second] {
            match next_terminal(&mut events).await {
                WorkerEvent::JobFailed { task_id, error } => {
                    assert_eq!(task_id, expected);
                    assert!(error.starts_with("execution error: engine panicked"));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_task_is_skipped() {
        let f = fixture(Arc::new(NoOpEngine), WorkerConfig::default().with_max_workers(1));
        let id = enqueue(&f).await;
        f.tracker
            .update(id, |_| Ok(Some(Transition::Cancel)))
            .await
            .unwrap();

        let mut events = f.pool.events();
        let handle = f.pool.start();
        assert_eq!(
            next_terminal(&mut events).await,
            WorkerEvent::JobSkipped { task_id: id }
        );
        assert_eq!(
            f.tracker.get(id).await.unwrap().status,
            TaskStatus::Cancelled
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_workers() {
        let f = fixture(Arc::new(NoOpEngine), WorkerConfig::default().with_max_workers(3));
        let mut events = f.pool.events();
        let handle = f.pool.start();
        assert_eq!(handle.worker_count(), 3);
        handle.shutdown().await;

        let mut stopped = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, WorkerEvent::WorkerStopped { .. }) {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 3);

        // Nothing is pulled after shutdown.
        let id = enqueue(&f).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.queue.contains(id));
    }

    #[tokio::test]
    async fn test_outcome_is_recorded_after_store_outage() {
        let store = Arc::new(MemoryTaskRepository::new());
        let engine = Arc::new(OutageEngine {
            store: store.clone(),
            outage: Duration::from_millis(100),
        });
        let f = fixture_on(store, engine, WorkerConfig::default().with_max_workers(1));
        let mut events = f.pool.events();
        let handle = f.pool.start();
        let id = enqueue(&f).await;

        assert!(matches!(
            next_terminal(&mut events).await,
            WorkerEvent::JobCompleted { task_id, .. } if task_id == id
        ));
        let stored = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(f.tracker.tracked().await, 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_pickup_survives_store_outage() {
        let f = fixture(Arc::new(NoOpEngine), WorkerConfig::default().with_max_workers(1));
        let id = enqueue(&f).await;
        let mut events = f.pool.events();

        f.store.set_unavailable(true);
        let handle = f.pool.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.store.set_unavailable(false);

        assert!(matches!(
            next_terminal(&mut events).await,
            WorkerEvent::JobCompleted { task_id, .. } if task_id == id
        ));
        assert_eq!(
            f.tracker.get(id).await.unwrap().status,
            TaskStatus::Completed
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_pickup_retry() {
        let f = fixture(Arc::new(NoOpEngine), WorkerConfig::default().with_max_workers(1));
        let id = enqueue(&f).await;

        f.store.set_unavailable(true);
        let handle = f.pool.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown while the store is down");
        f.store.set_unavailable(false);

        assert_eq!(
            f.store.get(id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_timed_out_input_released_after_engine_returns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.wav");
        std::fs::write(&path, b"RIFF").unwrap();

        let (release, blocked) = std::sync::mpsc::channel();
        let engine = Arc::new(BlockingEngine {
            release: std::sync::Mutex::new(blocked),
        });
        let f = fixture(
            engine,
            WorkerConfig::default()
                .with_max_workers(1)
                .with_job_timeout(Duration::from_millis(50)),
        );
        let mut events = f.pool.events();
        let handle = f.pool.start();
        let id = enqueue_spec(&f, JobSpec::new(path.to_str().unwrap()).staged()).await;

        assert!(matches!(
            next_terminal(&mut events).await,
            WorkerEvent::JobFailed { task_id, .. } if task_id == id
        ));
        // The engine may still be reading the file.
        assert!(path.exists());

        release.send(()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while path.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!path.exists());

        handle.shutdown().await;
    }
}
