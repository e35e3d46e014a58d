//! # vocalis-jobs
//!
//! Transcription job runtime for vocalis.
//!
//! This crate provides:
//! - Admission control in front of a bounded FIFO queue
//! - A fixed-size worker pool running a blocking engine under a timeout
//! - Owner-scoped status reads, cancellation and paginated history
//! - Startup recovery of tasks left unfinished by a previous process
//! - Worker lifecycle notifications via a broadcast channel
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vocalis_jobs::{CommandEngine, JobSpec, ServiceConfig, TranscriptionService};
//! use vocalis_db::MemoryTaskRepository;
//!
//! let service = TranscriptionService::start(
//!     ServiceConfig::from_env()?,
//!     Arc::new(MemoryTaskRepository::new()),
//!     Arc::new(CommandEngine::from_env()),
//! )
//! .await?;
//!
//! let id = service
//!     .submit("api-key-1", JobSpec::new("/uploads/call.wav").with_language("en"))
//!     .await?;
//!
//! let mut events = service.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! service.shutdown().await;
//! ```

pub mod cancel;
pub mod dispatcher;
pub mod engine;
pub mod history;
pub mod intake;
pub mod queue;
pub mod recovery;
pub mod service;
pub mod staging;
pub mod tracker;

// Re-export core types
pub use vocalis_core::*;

pub use cancel::CancellationController;
pub use dispatcher::{WorkerConfig, WorkerEvent, WorkerHandle, WorkerPool};
pub use engine::{
    CommandEngine, CommandEngineConfig, EngineRequest, NoOpEngine, TranscriptionEngine,
};
pub use history::{HistoryConfig, HistoryService};
pub use intake::IntakeGate;
pub use queue::{JobQueue, Reservation};
pub use recovery::{recover, RecoveryPolicy, RecoveryReport};
pub use service::{QueueSnapshot, ServiceConfig, TranscriptionService};
pub use tracker::{StatusTracker, UpdateOutcome};
