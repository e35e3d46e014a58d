//! Admission control for new transcription jobs.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use vocalis_core::{JobSpec, Result, TaskId, TaskRecord};

use crate::queue::JobQueue;
use crate::staging::release_staged_path;
use crate::tracker::StatusTracker;

/// Validates submissions and admits them into the bounded queue.
pub struct IntakeGate {
    queue: Arc<JobQueue>,
    tracker: Arc<StatusTracker>,
}

impl IntakeGate {
    pub fn new(queue: Arc<JobQueue>, tracker: Arc<StatusTracker>) -> Self {
        Self { queue, tracker }
    }

    /// Admit one job for `owner`.
    ///
    /// On success exactly one `queued` record exists and exactly one queue
    /// entry refers to it. On any error neither exists and a staged input is
    /// released.
    pub async fn submit(&self, owner: &str, spec: JobSpec) -> Result<TaskId> {
        match self.admit(owner, &spec).await {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "intake",
                    op = "submit",
                    owner,
                    queue_depth = self.queue.len(),
                    error = %e,
                    "Submission rejected"
                );
                if spec.staged {
                    release_staged_path(&spec.input_path).await;
                }
                Err(e)
            }
        }
    }

    async fn admit(&self, owner: &str, spec: &JobSpec) -> Result<TaskId> {
        let job = spec.validate(owner)?;
        let reservation = self.queue.try_reserve()?;

        let record = TaskRecord::new_queued(job, Utc::now());
        let id = record.id;
        let model_size = record.model_size;
        // The reservation is returned on drop if this fails.
        self.tracker.insert(record).await?;
        reservation.commit(id);

        info!(
            subsystem = "jobs",
            component = "intake",
            op = "submit",
            task_id = %id,
            owner,
            model_size = %model_size,
            queue_depth = self.queue.len(),
            "Task queued"
        );
        Ok(id)
    }
}
