//! Centralized default constants for vocalis.
//!
//! Every crate reads its fallback values from here. Environment overrides are
//! applied by the config types that own each concern (`ServiceConfig`,
//! `PoolConfig`, `CommandEngineConfig`).

// =============================================================================
// ADMISSION
// =============================================================================

/// Maximum number of not-yet-started tasks the queue will hold.
pub const QUEUE_CAPACITY: usize = 25;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Number of concurrent workers in the dispatcher pool.
pub const MAX_WORKERS: usize = 3;

/// Hard per-job execution timeout in seconds (two hours).
pub const JOB_TIMEOUT_SECS: u64 = 7200;

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// First delay before retrying a status write the store rejected.
pub const STORE_RETRY_INITIAL_MS: u64 = 50;

/// Upper bound on the delay between status write retries.
pub const STORE_RETRY_MAX_MS: u64 = 5_000;

// =============================================================================
// HISTORY / PAGINATION
// =============================================================================

/// Page size used when the caller passes no limit (or zero).
pub const HISTORY_LIMIT: i64 = 50;

/// Largest page size a caller may request; larger values are clamped.
pub const HISTORY_MAX_LIMIT: i64 = 200;

// =============================================================================
// JOB PARAMETERS
// =============================================================================

/// Model size used when a submission does not specify one.
pub const MODEL_SIZE: &str = "large";

/// Concrete model the engine loads for `auto`.
pub const AUTO_MODEL_SIZE: &str = "large";

/// Minimum length of a language code.
pub const LANGUAGE_MIN_LEN: usize = 2;

/// Maximum length of a language code.
pub const LANGUAGE_MAX_LEN: usize = 12;

// =============================================================================
// ENGINE
// =============================================================================

/// Executable invoked by the command-line engine adapter.
pub const ENGINE_COMMAND: &str = "whisper-cli";

/// Directory holding `ggml-<size>.bin` model files.
pub const MODELS_DIR: &str = "models";

// =============================================================================
// DATABASE POOL
// =============================================================================

/// Maximum connections in the pool.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// Minimum idle connections kept open.
pub const DB_MIN_CONNECTIONS: u32 = 1;

/// Seconds to wait for a connection before failing.
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Seconds an idle connection lives before being closed.
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;

/// Maximum lifetime of a connection in seconds.
pub const DB_MAX_LIFETIME_SECS: u64 = 1800;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_limits_are_consistent() {
        assert!(HISTORY_LIMIT >= 1);
        assert!(HISTORY_LIMIT <= HISTORY_MAX_LIMIT);
    }

    #[test]
    fn test_pool_bounds() {
        assert!(DB_MIN_CONNECTIONS <= DB_MAX_CONNECTIONS);
        assert!(DB_IDLE_TIMEOUT_SECS < DB_MAX_LIFETIME_SECS);
    }

    #[test]
    fn test_store_retry_backoff_bounds() {
        assert!(STORE_RETRY_INITIAL_MS > 0);
        assert!(STORE_RETRY_INITIAL_MS <= STORE_RETRY_MAX_MS);
    }

    #[test]
    fn test_language_bounds() {
        assert!(LANGUAGE_MIN_LEN < LANGUAGE_MAX_LEN);
    }
}
