//! Release of staged (temporary) job inputs.

use std::io::ErrorKind;

use tracing::{debug, warn};

use vocalis_core::TaskRecord;

/// Delete a staged input file. A file that is already gone is not an error;
/// any other failure is logged and swallowed so the task outcome stands.
pub async fn release_staged_path(path: &str) {
    if path.trim().is_empty() {
        return;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(
            subsystem = "jobs",
            component = "staging",
            op = "release",
            path,
            "Released staged input"
        ),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(
            subsystem = "jobs",
            component = "staging",
            op = "release",
            path,
            error = %e,
            "Failed to release staged input"
        ),
    }
}

/// Release the record's input if the service owns it.
pub async fn release_staged_input(record: &TaskRecord) {
    if record.staged {
        release_staged_path(&record.input_path).await;
    }
}
