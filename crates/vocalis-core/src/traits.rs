//! Storage traits for vocalis.
//!
//! The job runtime only talks to its durable store through these traits, so
//! PostgreSQL and the in-memory store are interchangeable.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// TASK REPOSITORY TRAITS
// =============================================================================

/// Owner-scoped history request as passed to the store.
///
/// `limit` and `offset` are already clamped by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskQuery {
    pub owner: String,
    pub status: Option<TaskStatus>,
    pub limit: i64,
    pub offset: i64,
}

/// Records for one page plus the number of matching records overall.
#[derive(Debug, Clone, Default)]
pub struct TaskPage {
    pub records: Vec<TaskRecord>,
    pub total: i64,
}

/// Durable store for task records.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Persist a newly created record. Fails if the id already exists.
    async fn insert(&self, record: &TaskRecord) -> Result<()>;

    /// Point lookup by id.
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>>;

    /// Overwrite the mutable fields of `record` only if the stored status is
    /// still `expected`. Returns `false` when the condition did not hold.
    async fn update_if_status(&self, record: &TaskRecord, expected: TaskStatus) -> Result<bool>;

    /// Records owned by `query.owner`, newest first (`created_at` desc, then
    /// `id` desc), with the optional status filter applied.
    async fn query_by_owner(&self, query: &TaskQuery) -> Result<TaskPage>;

    /// All `queued` and `processing` records, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>>;

    /// Counts by status, for one owner or across all owners.
    async fn stats(&self, owner: Option<&str>) -> Result<TaskStats>;
}
