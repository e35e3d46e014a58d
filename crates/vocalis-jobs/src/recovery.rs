//! Startup recovery of tasks left unfinished by a previous process.

use std::fmt;
use std::str::FromStr;

use tracing::{info, warn};

use vocalis_core::{Error, Result, TaskRecord, TaskStatus, Transition};

use crate::queue::JobQueue;
use crate::staging::release_staged_input;
use crate::tracker::StatusTracker;

/// What to do with `queued` and `processing` records found at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Fail every unfinished record and flag it for replay.
    #[default]
    FailOrphans,
    /// Re-enqueue `queued` records in creation order; fail the rest.
    RequeueQueued,
}

impl RecoveryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPolicy::FailOrphans => "fail-orphans",
            RecoveryPolicy::RequeueQueued => "requeue-queued",
        }
    }
}

impl fmt::Display for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "fail-orphans" | "fail" => Ok(RecoveryPolicy::FailOrphans),
            "requeue-queued" | "requeue" => Ok(RecoveryPolicy::RequeueQueued),
            other => Err(Error::Config(format!(
                "unknown recovery policy '{}' (expected fail-orphans or requeue-queued)",
                other
            ))),
        }
    }
}

/// Counts from one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed: usize,
    pub requeued: usize,
}

fn orphan_message(record: &TaskRecord) -> String {
    format!(
        "task was {} when the service stopped; resubmit to run it again",
        record.status
    )
}

const OVERFLOW_MESSAGE: &str =
    "queue capacity exceeded while restoring queued tasks; resubmit to run it again";

/// Apply `policy` to every unfinished record in the store.
pub async fn recover(
    tracker: &StatusTracker,
    queue: &JobQueue,
    policy: RecoveryPolicy,
) -> Result<RecoveryReport> {
    let unfinished = tracker.store().list_unfinished().await?;
    let mut report = RecoveryReport::default();

    for record in unfinished {
        if policy == RecoveryPolicy::RequeueQueued && record.status == TaskStatus::Queued {
            match queue.try_reserve() {
                Ok(reservation) => {
                    let id = record.id;
                    tracker.rehydrate(record).await;
                    reservation.commit(id);
                    report.requeued += 1;
                    continue;
                }
                Err(_) => {
                    fail_orphan(tracker, record, OVERFLOW_MESSAGE.to_string()).await?;
                    report.failed += 1;
                    continue;
                }
            }
        }

        let message = orphan_message(&record);
        fail_orphan(tracker, record, message).await?;
        report.failed += 1;
    }

    info!(
        subsystem = "jobs",
        component = "recovery",
        op = "recover",
        policy = %policy,
        failed = report.failed,
        requeued = report.requeued,
        queue_depth = queue.len(),
        "Startup recovery finished"
    );
    Ok(report)
}

async fn fail_orphan(tracker: &StatusTracker, record: TaskRecord, message: String) -> Result<()> {
    let id = record.id;
    tracker
        .update(id, |current| {
            if current.status.is_terminal() {
                Ok(None)
            } else {
                Ok(Some(Transition::Recover(message)))
            }
        })
        .await?;
    warn!(
        subsystem = "jobs",
        component = "recovery",
        op = "fail_orphan",
        task_id = %id,
        status = %record.status,
        "Unfinished task failed on startup"
    );
    release_staged_input(&record).await;
    Ok(())
}
