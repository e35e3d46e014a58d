//! # vocalis-core
//!
//! Core types, the task state machine, and repository traits for vocalis.
//!
//! The other vocalis crates depend on this one for the `Error` taxonomy,
//! shared defaults, and the `TaskRepository` seam
//! between the job runtime and its durable store.

pub mod defaults;
pub mod error;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
