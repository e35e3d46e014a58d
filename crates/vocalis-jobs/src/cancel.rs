//! Owner-initiated cancellation of queued tasks.

use std::sync::Arc;

use tracing::info;

use vocalis_core::{Error, Result, TaskId, TaskRecord, TaskStatus, Transition};

use crate::queue::JobQueue;
use crate::staging::release_staged_input;
use crate::tracker::StatusTracker;

/// Cancels tasks that have not been picked up yet.
pub struct CancellationController {
    queue: Arc<JobQueue>,
    tracker: Arc<StatusTracker>,
}

impl CancellationController {
    pub fn new(queue: Arc<JobQueue>, tracker: Arc<StatusTracker>) -> Self {
        Self { queue, tracker }
    }

    /// Move `id` from `queued` to `cancelled`.
    ///
    /// Fails with `TaskNotFound`, `Forbidden` for another owner's task, or
    /// `InvalidState` once the task is in flight or settled. If the entry is
    /// still queued it is withdrawn and its staged input released here;
    /// otherwise the worker that dequeued it does so.
    pub async fn cancel(&self, id: TaskId, owner: &str) -> Result<TaskRecord> {
        let record = self.tracker.get(id).await?;
        if !record.is_owned_by(owner) {
            return Err(Error::Forbidden(format!("task {} belongs to another owner", id)));
        }

        let cancelled = self
            .tracker
            .update(id, |current| match current.status {
                TaskStatus::Queued => Ok(Some(Transition::Cancel)),
                TaskStatus::Processing => Err(Error::InvalidState(
                    "cannot cancel in-flight job".to_string(),
                )),
                _ => Err(Error::InvalidState("already terminal".to_string())),
            })
            .await?
            .into_record();

        let withdrawn = self.queue.remove(id);
        if withdrawn {
            release_staged_input(&cancelled).await;
        }

        info!(
            subsystem = "jobs",
            component = "cancel",
            op = "cancel",
            task_id = %id,
            owner,
            withdrawn,
            queue_depth = self.queue.len(),
            "Task cancelled"
        );
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::IntakeGate;
    use serde_json::json;
    use vocalis_core::JobSpec;
    use vocalis_db::MemoryTaskRepository;

    struct Fixture {
        intake: IntakeGate,
        controller: CancellationController,
        queue: Arc<JobQueue>,
        tracker: Arc<StatusTracker>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryTaskRepository::new());
        let queue = Arc::new(JobQueue::new(10));
        let tracker = Arc::new(StatusTracker::new(store));
        Fixture {
            intake: IntakeGate::new(queue.clone(), tracker.clone()),
            controller: CancellationController::new(queue.clone(), tracker.clone()),
            queue,
            tracker,
        }
    }

    #[tokio::test]
    async fn test_cancel_queued() {
        let f = fixture();
        let id = f.intake.submit("a", JobSpec::new("/1.wav")).await.unwrap();

        let record = f.controller.cancel(id, "a").await.unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert!(record.completed_at.is_some());
        assert!(!f.queue.contains(id));
    }

    #[tokio::test]
    async fn test_cancel_keeps_remaining_order() {
        let f = fixture();
        let first = f.intake.submit("a", JobSpec::new("/1.wav")).await.unwrap();
        let second = f.intake.submit("a", JobSpec::new("/2.wav")).await.unwrap();
        let third = f.intake.submit("a", JobSpec::new("/3.wav")).await.unwrap();

        f.controller.cancel(second, "a").await.unwrap();

        let token = tokio_util::sync::CancellationToken::new();
        assert_eq!(f.queue.pop(&token).await, Some(first));
        assert_eq!(f.queue.pop(&token).await, Some(third));
    }

    #[tokio::test]
    async fn test_cancel_unknown() {
        let f = fixture();
        let err = f
            .controller
            .cancel(uuid::Uuid::now_v7(), "a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_other_owner_forbidden() {
        let f = fixture();
        let id = f.intake.submit("a", JobSpec::new("/1.wav")).await.unwrap();

        let err = f.controller.cancel(id, "b").await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert!(f.queue.contains(id));
    }

    #[tokio::test]
    async fn test_cancel_twice() {
        let f = fixture();
        let id = f.intake.submit("a", JobSpec::new("/1.wav")).await.unwrap();
        f.controller.cancel(id, "a").await.unwrap();

        let err = f.controller.cancel(id, "a").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid state: already terminal");
    }

    #[tokio::test]
    async fn test_cancel_processing_rejected() {
        let f = fixture();
        let id = f.intake.submit("a", JobSpec::new("/1.wav")).await.unwrap();
        f.tracker
            .update(id, |_| Ok(Some(Transition::Pickup)))
            .await
            .unwrap();

        let err = f.controller.cancel(id, "a").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid state: cannot cancel in-flight job");
    }

    #[tokio::test]
    async fn test_cancel_completed_rejected() {
        let f = fixture();
        let id = f.intake.submit("a", JobSpec::new("/1.wav")).await.unwrap();
        f.tracker
            .update(id, |_| Ok(Some(Transition::Pickup)))
            .await
            .unwrap();
        f.tracker
            .update(id, |_| Ok(Some(Transition::Complete(json!({"text": "ok"})))))
            .await
            .unwrap();

        let err = f.controller.cancel(id, "a").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(msg) if msg == "already terminal"));
    }

    #[tokio::test]
    async fn test_cancel_releases_staged_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.wav");
        std::fs::write(&path, b"data").unwrap();

        let f = fixture();
        let spec = JobSpec::new(path.to_str().unwrap()).staged();
        let id = f.intake.submit("a", spec).await.unwrap();
        assert!(path.exists());

        f.controller.cancel(id, "a").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cancel_after_dequeue_leaves_release_to_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.wav");
        std::fs::write(&path, b"data").unwrap();

        let f = fixture();
        let spec = JobSpec::new(path.to_str().unwrap()).staged();
        let id = f.intake.submit("a", spec).await.unwrap();

        // A worker has taken the entry but not yet moved it to processing.
        let token = tokio_util::sync::CancellationToken::new();
        assert_eq!(f.queue.pop(&token).await, Some(id));

        let record = f.controller.cancel(id, "a").await.unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert!(path.exists());
    }
}
