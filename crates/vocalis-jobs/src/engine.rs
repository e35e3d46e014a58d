//! Transcription engine seam.
//!
//! The engine is a blocking, non-interruptible call. The dispatcher runs it
//! on the runtime's blocking pool under a timeout; an engine call that
//! outlives the timeout keeps its thread until it returns.

use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use vocalis_core::{defaults, Error, ModelSize, Result, TaskId, TaskRecord};

/// What the engine needs to know about one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRequest {
    pub task_id: TaskId,
    pub input_path: PathBuf,
    pub model_size: ModelSize,
    pub language: Option<String>,
    pub diarization: bool,
}

impl From<&TaskRecord> for EngineRequest {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id,
            input_path: PathBuf::from(&record.input_path),
            model_size: record.model_size,
            language: record.language.clone(),
            diarization: record.diarization_enabled,
        }
    }
}

/// Blocking transcription backend.
pub trait TranscriptionEngine: Send + Sync {
    /// Transcribe one input. Errors become the task's failure message.
    fn transcribe(&self, request: &EngineRequest) -> Result<JsonValue>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Engine that returns an empty transcript (for testing).
#[derive(Debug, Default, Clone)]
pub struct NoOpEngine;

impl TranscriptionEngine for NoOpEngine {
    fn transcribe(&self, _request: &EngineRequest) -> Result<JsonValue> {
        Ok(serde_json::json!({ "text": "", "segments": [] }))
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Configuration for [`CommandEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEngineConfig {
    /// Executable to run.
    pub command: PathBuf,
    /// Directory containing `ggml-<size>.bin` model files.
    pub models_dir: PathBuf,
}

impl Default for CommandEngineConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from(defaults::ENGINE_COMMAND),
            models_dir: PathBuf::from(defaults::MODELS_DIR),
        }
    }
}

impl CommandEngineConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `VOCALIS_ENGINE_CMD` | `whisper-cli` | Engine executable |
    /// | `VOCALIS_MODELS_DIR` | `models` | Directory of model files |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(command) = std::env::var("VOCALIS_ENGINE_CMD") {
            if !command.trim().is_empty() {
                config.command = PathBuf::from(command);
            }
        }
        if let Ok(dir) = std::env::var("VOCALIS_MODELS_DIR") {
            if !dir.trim().is_empty() {
                config.models_dir = PathBuf::from(dir);
            }
        }
        config
    }

    pub fn with_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.models_dir = dir.into();
        self
    }
}

/// Runs a whisper.cpp style command line and parses its JSON stdout.
///
/// Invocation: `<command> -m <models_dir>/ggml-<size>.bin -l <lang> -f <input> -oj [--diarize]`
/// where `<lang>` is `auto` when the job has no language.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    config: CommandEngineConfig,
}

impl CommandEngine {
    pub fn new(config: CommandEngineConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(CommandEngineConfig::from_env())
    }

    fn model_file(&self, size: ModelSize) -> PathBuf {
        let name = match size {
            ModelSize::Auto => defaults::AUTO_MODEL_SIZE,
            other => other.as_str(),
        };
        self.config.models_dir.join(format!("ggml-{}.bin", name))
    }

    /// Build the process invocation for `request`.
    pub fn command(&self, request: &EngineRequest) -> Command {
        let mut command = Command::new(&self.config.command);
        command
            .arg("-m")
            .arg(self.model_file(request.model_size))
            .arg("-l")
            .arg(request.language.as_deref().unwrap_or("auto"))
            .arg("-f")
            .arg(&request.input_path)
            .arg("-oj");
        if request.diarization {
            command.arg("--diarize");
        }
        command
    }
}

impl TranscriptionEngine for CommandEngine {
    fn transcribe(&self, request: &EngineRequest) -> Result<JsonValue> {
        debug!(
            subsystem = "jobs",
            component = "engine",
            op = "transcribe",
            task_id = %request.task_id,
            model_size = %request.model_size,
            command = %self.config.command.display(),
            "Invoking transcription command"
        );

        let output = self.command(request).output().map_err(|e| {
            Error::Execution(format!(
                "failed to run {}: {}",
                self.config.command.display(),
                e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            return Err(Error::Execution(if detail.is_empty() {
                format!("engine exited with {}", output.status)
            } else {
                detail.to_string()
            }));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Execution(format!("invalid engine output: {}", e)))
    }

    fn name(&self) -> &str {
        "command"
    }
}
