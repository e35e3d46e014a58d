//! Error types for vocalis.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using vocalis's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for vocalis operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Submission was malformed; no state was created.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Admission rejected because the queue is at capacity.
    #[error("Queue full: {capacity} tasks already waiting, retry later")]
    QueueFull { capacity: usize },

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// Caller does not own the task
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Operation is not legal for the task's current status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // The two execution variants render exactly as the message stored on a
    // failed task record.
    /// Engine call exceeded the hard execution timeout.
    #[error("timeout after {} seconds", format_secs(.0))]
    Timeout(Duration),

    /// Transcription engine reported a failure.
    #[error("execution error: {0}")]
    Execution(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may succeed by retrying the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::QueueFull { .. } | Error::Database(_))
    }

    /// Convert any error raised while running a job into the message stored
    /// on the failed record.
    pub fn into_failure_message(self) -> String {
        match self {
            Error::Execution(_) | Error::Timeout(_) => self.to_string(),
            other => Error::Execution(other.to_string()).to_string(),
        }
    }
}

fn format_secs(duration: &Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{:.3}", duration.as_secs_f64())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
