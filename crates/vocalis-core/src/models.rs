//! Task records, job specifications, and the status state machine.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};

/// Identifier of a transcription task (UUIDv7, time ordered).
pub type TaskId = Uuid;

// =============================================================================
// STATUS STATE MACHINE
// =============================================================================

/// Lifecycle status of a transcription task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown task status: {}", other))),
        }
    }
}

/// A requested change of task status.
///
/// The table in [`Transition::is_allowed_from`] is the only place legal
/// status changes are defined:
///
/// | Transition | From | To |
/// |------------|------|----|
/// | `Pickup` | queued | processing |
/// | `Cancel` | queued | cancelled |
/// | `Complete` | processing | completed |
/// | `Fail` | processing | failed |
/// | `Recover` | queued, processing | failed |
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// A worker started executing the job.
    Pickup,
    /// The engine returned a result payload.
    Complete(JsonValue),
    /// The engine failed or timed out.
    Fail(String),
    /// The owner cancelled the task before pickup.
    Cancel,
    /// Startup recovery found the task unfinished after a restart.
    Recover(String),
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Pickup => "pickup",
            Transition::Complete(_) => "complete",
            Transition::Fail(_) => "fail",
            Transition::Cancel => "cancel",
            Transition::Recover(_) => "recover",
        }
    }

    pub fn target(&self) -> TaskStatus {
        match self {
            Transition::Pickup => TaskStatus::Processing,
            Transition::Complete(_) => TaskStatus::Completed,
            Transition::Fail(_) | Transition::Recover(_) => TaskStatus::Failed,
            Transition::Cancel => TaskStatus::Cancelled,
        }
    }

    pub fn is_allowed_from(&self, from: TaskStatus) -> bool {
        match self {
            Transition::Pickup | Transition::Cancel => from == TaskStatus::Queued,
            Transition::Complete(_) | Transition::Fail(_) => from == TaskStatus::Processing,
            Transition::Recover(_) => {
                matches!(from, TaskStatus::Queued | TaskStatus::Processing)
            }
        }
    }
}

// =============================================================================
// JOB PARAMETERS
// =============================================================================

/// Transcription model size accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
    Auto,
}

impl ModelSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
            ModelSize::Auto => "auto",
        }
    }
}

impl Default for ModelSize {
    fn default() -> Self {
        ModelSize::Large
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            "auto" => Ok(ModelSize::Auto),
            other => Err(Error::InvalidJob(format!(
                "model_size must be one of tiny, base, small, medium, large, auto (got '{}')",
                other
            ))),
        }
    }
}

/// A transcription request as handed in by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Reference to the audio input the engine reads.
    pub input_path: String,
    /// Display name; defaults to the last path component.
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default = "default_model_size")]
    pub model_size: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub diarization: bool,
    /// The input is a temporary artifact released once the task settles.
    #[serde(default)]
    pub staged: bool,
}

fn default_model_size() -> String {
    defaults::MODEL_SIZE.to_string()
}

impl JobSpec {
    pub fn new(input_path: impl Into<String>) -> Self {
        Self {
            input_path: input_path.into(),
            filename: None,
            model_size: default_model_size(),
            language: None,
            diarization: false,
            staged: false,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_model_size(mut self, model_size: impl Into<String>) -> Self {
        self.model_size = model_size.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_diarization(mut self, enabled: bool) -> Self {
        self.diarization = enabled;
        self
    }

    pub fn staged(mut self) -> Self {
        self.staged = true;
        self
    }

    /// Check every field and resolve defaults. Nothing is created on failure.
    pub fn validate(&self, owner: &str) -> Result<ValidatedJob> {
        if owner.trim().is_empty() {
            return Err(Error::InvalidJob("owner must not be empty".to_string()));
        }
        if self.input_path.trim().is_empty() {
            return Err(Error::InvalidJob(
                "file reference must not be empty".to_string(),
            ));
        }

        let model_size = ModelSize::from_str(&self.model_size)?;

        let language = match self.language.as_deref() {
            None => None,
            Some(lang) => {
                validate_language(lang)?;
                Some(lang.to_string())
            }
        };

        let filename = match self.filename.as_deref() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => Path::new(&self.input_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.input_path.clone()),
        };

        Ok(ValidatedJob {
            owner: owner.to_string(),
            input_path: self.input_path.clone(),
            filename,
            model_size,
            language,
            diarization: self.diarization,
            staged: self.staged,
        })
    }
}

fn validate_language(lang: &str) -> Result<()> {
    let len = lang.chars().count();
    if !(defaults::LANGUAGE_MIN_LEN..=defaults::LANGUAGE_MAX_LEN).contains(&len) {
        return Err(Error::InvalidJob(format!(
            "language must be {}-{} characters (got {})",
            defaults::LANGUAGE_MIN_LEN,
            defaults::LANGUAGE_MAX_LEN,
            len
        )));
    }
    if !lang.chars().all(|c| c.is_ascii_alphabetic() || c == '-') {
        return Err(Error::InvalidJob(format!(
            "language may only contain ASCII letters and '-' (got '{}')",
            lang
        )));
    }
    Ok(())
}

/// A job that passed validation, ready to become a task record.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedJob {
    pub owner: String,
    pub input_path: String,
    pub filename: String,
    pub model_size: ModelSize,
    pub language: Option<String>,
    pub diarization: bool,
    pub staged: bool,
}

// =============================================================================
// TASK RECORD
// =============================================================================

/// One submitted transcription job and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub owner: String,
    pub status: TaskStatus,
    pub filename: String,
    pub model_size: ModelSize,
    pub language: Option<String>,
    pub diarization_enabled: bool,
    pub input_path: String,
    pub staged: bool,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub replay_required: bool,
    /// Audio length in seconds, as reported by the engine.
    #[serde(default)]
    pub duration_sec: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a fresh `queued` record with a new time-ordered id.
    pub fn new_queued(job: ValidatedJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            owner: job.owner,
            status: TaskStatus::Queued,
            filename: job.filename,
            model_size: job.model_size,
            language: job.language,
            diarization_enabled: job.diarization,
            input_path: job.input_path,
            staged: job.staged,
            result: None,
            error_message: None,
            replay_required: false,
            duration_sec: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Produce the record that results from `transition`, or reject it.
    ///
    /// Timestamps never move backwards: a clock reading earlier than the
    /// previous timestamp is clamped to it.
    pub fn apply(&self, transition: Transition, now: DateTime<Utc>) -> Result<TaskRecord> {
        if !transition.is_allowed_from(self.status) {
            return Err(Error::InvalidState(format!(
                "cannot {} task {} in status {}",
                transition.name(),
                self.id,
                self.status
            )));
        }

        let floor = self.started_at.unwrap_or(self.created_at);
        let now = now.max(floor);

        let mut next = self.clone();
        next.status = transition.target();
        match transition {
            Transition::Pickup => {
                next.started_at = Some(now);
            }
            Transition::Complete(result) => {
                next.duration_sec = audio_duration(&result);
                next.result = Some(result);
                next.completed_at = Some(now);
            }
            Transition::Fail(message) => {
                next.error_message = Some(message);
                next.completed_at = Some(now);
            }
            Transition::Cancel => {
                next.completed_at = Some(now);
            }
            Transition::Recover(message) => {
                next.error_message = Some(message);
                next.replay_required = true;
                next.completed_at = Some(now);
            }
        }
        Ok(next)
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner == owner
    }

    /// Caller-facing projection without owner or input location.
    pub fn view(&self) -> TaskRecordView {
        TaskRecordView {
            id: self.id,
            status: self.status,
            filename: self.filename.clone(),
            model_size: self.model_size,
            language: self.language.clone(),
            diarization_enabled: self.diarization_enabled,
            result: self.result.clone(),
            error_message: self.error_message.clone(),
            replay_required: self.replay_required,
            duration_sec: self.duration_sec,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// The `duration` field of an engine result; zero or missing means unknown.
fn audio_duration(result: &JsonValue) -> Option<f64> {
    result
        .get("duration")
        .and_then(JsonValue::as_f64)
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// What a caller sees when reading a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecordView {
    pub id: TaskId,
    pub status: TaskStatus,
    pub filename: String,
    pub model_size: ModelSize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub diarization_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replay_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// QUERY RESULTS
// =============================================================================

/// One page of an owner's task history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub tasks: Vec<TaskRecordView>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

/// Task counts by status, plus processed audio time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: i64,
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    /// Sum of `duration_sec` over the counted records.
    pub total_duration_sec: f64,
    /// `total_duration_sec / completed`, or 0 with nothing completed.
    pub avg_duration_sec: f64,
}

impl TaskStats {
    /// Add `count` records with `status`.
    pub fn add(&mut self, status: TaskStatus, count: i64) {
        self.total += count;
        match status {
            TaskStatus::Queued => self.queued += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
    }

    /// Set the audio total and derive the per-completion average.
    pub fn with_total_duration(mut self, total_duration_sec: f64) -> Self {
        self.total_duration_sec = total_duration_sec;
        self.avg_duration_sec = if self.completed > 0 {
            total_duration_sec / self.completed as f64
        } else {
            0.0
        };
        self
    }
}
