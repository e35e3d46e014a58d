//! Paginated, owner-scoped task history.

use std::sync::Arc;

use tracing::debug;

use vocalis_core::{
    defaults, Error, HistoryPage, Result, TaskQuery, TaskRepository, TaskStats, TaskStatus,
};

/// Page size limits for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryConfig {
    pub default_limit: i64,
    pub max_limit: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_limit: defaults::HISTORY_LIMIT,
            max_limit: defaults::HISTORY_MAX_LIMIT,
        }
    }
}

impl HistoryConfig {
    /// Resolve a requested page size: missing or zero means the default,
    /// anything else is clamped into `[1, max_limit]`.
    pub fn effective_limit(&self, requested: Option<i64>) -> i64 {
        match requested {
            None | Some(0) => self.default_limit,
            Some(n) => n.clamp(1, self.max_limit),
        }
    }
}

/// Read-only queries over the task store.
pub struct HistoryService {
    store: Arc<dyn TaskRepository>,
    config: HistoryConfig,
}

impl HistoryService {
    pub fn new(store: Arc<dyn TaskRepository>, config: HistoryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// One page of `owner`'s tasks, newest first.
    pub async fn query(
        &self,
        owner: &str,
        status: Option<TaskStatus>,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<HistoryPage> {
        if owner.trim().is_empty() {
            return Err(Error::InvalidInput("owner must not be empty".to_string()));
        }
        if offset < 0 {
            return Err(Error::InvalidInput(format!(
                "offset must be non-negative (got {})",
                offset
            )));
        }
        let limit = self.config.effective_limit(limit);

        let page = self
            .store
            .query_by_owner(&TaskQuery {
                owner: owner.to_string(),
                status,
                limit,
                offset,
            })
            .await?;

        let has_more = offset.saturating_add(limit) < page.total;
        debug!(
            subsystem = "jobs",
            component = "history",
            op = "query",
            owner,
            limit,
            offset,
            result_count = page.records.len(),
            total = page.total,
            has_more,
            "History page"
        );

        Ok(HistoryPage {
            tasks: page.records.iter().map(|r| r.view()).collect(),
            total: page.total,
            limit,
            offset,
            has_more,
        })
    }

    /// Task counts by status for one owner, or for everyone.
    pub async fn stats(&self, owner: Option<&str>) -> Result<TaskStats> {
        self.store.stats(owner).await
    }
}
