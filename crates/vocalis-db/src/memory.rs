//! In-process task store.
//!
//! Same contract as [`PgTaskRepository`](crate::PgTaskRepository) without a
//! database. Used for embedding the service without PostgreSQL and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use vocalis_core::{
    Error, Result, TaskId, TaskPage, TaskQuery, TaskRecord, TaskRepository, TaskStats, TaskStatus,
};

#[derive(Default)]
pub struct MemoryTaskRepository {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
    unavailable: AtomicBool,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn insert(&self, record: &TaskRecord) -> Result<()> {
        self.check_available()?;
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(Error::InvalidInput(format!(
                "task {} already exists",
                record.id
            )));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        self.check_available()?;
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update_if_status(&self, record: &TaskRecord, expected: TaskStatus) -> Result<bool> {
        self.check_available()?;
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(stored) if stored.status == expected => {
                stored.status = record.status;
                stored.result = record.result.clone();
                stored.error_message = record.error_message.clone();
                stored.replay_required = record.replay_required;
                stored.started_at = record.started_at;
                stored.completed_at = record.completed_at;
                stored.duration_sec = record.duration_sec;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn query_by_owner(&self, query: &TaskQuery) -> Result<TaskPage> {
        self.check_available()?;
        let records = self.records.read().await;
        let mut matching: Vec<&TaskRecord> = records
            .values()
            .filter(|r| r.owner == query.owner)
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let total = matching.len() as i64;
        let records = matching
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(TaskPage { records, total })
    }

    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>> {
        self.check_available()?;
        let records = self.records.read().await;
        let mut unfinished: Vec<TaskRecord> = records
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        unfinished.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(unfinished)
    }

    async fn stats(&self, owner: Option<&str>) -> Result<TaskStats> {
        self.check_available()?;
        let records = self.records.read().await;
        let mut stats = TaskStats::default();
        let mut total_duration = 0.0;
        for record in records
            .values()
            .filter(|r| owner.map_or(true, |o| r.owner == o))
        {
            stats.add(record.status, 1);
            total_duration += record.duration_sec.unwrap_or(0.0);
        }
        Ok(stats.with_total_duration(total_duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use vocalis_core::{JobSpec, Transition};

    fn record_for(owner: &str, offset_secs: i64) -> TaskRecord {
        let job = JobSpec::new("/tmp/a.wav").validate(owner).unwrap();
        TaskRecord::new_queued(job, Utc::now() + Duration::seconds(offset_secs))
    }

    fn query(owner: &str, limit: i64, offset: i64) -> TaskQuery {
        TaskQuery {
            owner: owner.to_string(),
            status: None,
            limit,
            offset,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let repo = MemoryTaskRepository::new();
        let record = record_for("a", 0);
        repo.insert(&record).await.unwrap();

        let fetched = repo.get(record.id).await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(repo.get(uuid::Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let repo = MemoryTaskRepository::new();
        let record = record_for("a", 0);
        repo.insert(&record).await.unwrap();
        assert!(repo.insert(&record).await.is_err());
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_if_status_is_conditional() {
        let repo = MemoryTaskRepository::new();
        let record = record_for("a", 0);
        repo.insert(&record).await.unwrap();

        let processing = record.apply(Transition::Pickup, Utc::now()).unwrap();
        assert!(repo
            .update_if_status(&processing, TaskStatus::Queued)
            .await
            .unwrap());

        // Stale writer still believes the task is queued.
        let cancelled = record.apply(Transition::Cancel, Utc::now()).unwrap();
        assert!(!repo
            .update_if_status(&cancelled, TaskStatus::Queued)
            .await
            .unwrap());

        let stored = repo.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_query_orders_newest_first_and_pages() {
        let repo = MemoryTaskRepository::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let record = record_for("a", i);
            ids.push(record.id);
            repo.insert(&record).await.unwrap();
        }
        repo.insert(&record_for("b", 0)).await.unwrap();

        let page = repo.query_by_owner(&query("a", 2, 0)).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].id, ids[4]);
        assert_eq!(page.records[1].id, ids[3]);

        let last = repo.query_by_owner(&query("a", 2, 4)).await.unwrap();
        assert_eq!(last.records.len(), 1);
        assert_eq!(last.records[0].id, ids[0]);

        let past_end = repo.query_by_owner(&query("a", 2, 10)).await.unwrap();
        assert!(past_end.records.is_empty());
        assert_eq!(past_end.total, 5);
    }

    #[tokio::test]
    async fn test_query_ties_broken_by_id_desc() {
        let repo = MemoryTaskRepository::new();
        let now = Utc::now();
        let job = JobSpec::new("/tmp/a.wav").validate("a").unwrap();
        let first = TaskRecord::new_queued(job.clone(), now);
        let second = TaskRecord::new_queued(job, now);
        repo.insert(&first).await.unwrap();
        repo.insert(&second).await.unwrap();

        let page = repo.query_by_owner(&query("a", 10, 0)).await.unwrap();
        let expected_first = first.id.max(second.id);
        assert_eq!(page.records[0].id, expected_first);
    }

    #[tokio::test]
    async fn test_query_status_filter() {
        let repo = MemoryTaskRepository::new();
        let keep = record_for("a", 0);
        let cancel = record_for("a", 1);
        repo.insert(&keep).await.unwrap();
        repo.insert(&cancel).await.unwrap();
        let cancelled = cancel.apply(Transition::Cancel, Utc::now()).unwrap();
        repo.update_if_status(&cancelled, TaskStatus::Queued)
            .await
            .unwrap();

        let mut q = query("a", 10, 0);
        q.status = Some(TaskStatus::Cancelled);
        let page = repo.query_by_owner(&q).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].id, cancel.id);
    }

    #[tokio::test]
    async fn test_list_unfinished_oldest_first() {
        let repo = MemoryTaskRepository::new();
        let newer = record_for("a", 10);
        let older = record_for("b", 0);
        let done = record_for("a", 5);
        repo.insert(&newer).await.unwrap();
        repo.insert(&older).await.unwrap();
        repo.insert(&done).await.unwrap();
        let finished = done
            .apply(Transition::Pickup, Utc::now())
            .unwrap()
            .apply(Transition::Complete(json!({"text": ""})), Utc::now())
            .unwrap();
        repo.update_if_status(&finished, TaskStatus::Queued)
            .await
            .unwrap();

        let unfinished = repo.list_unfinished().await.unwrap();
        let ids: Vec<_> = unfinished.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }

    #[tokio::test]
    async fn test_stats_scoped_by_owner() {
        let repo = MemoryTaskRepository::new();
        repo.insert(&record_for("a", 0)).await.unwrap();
        repo.insert(&record_for("a", 1)).await.unwrap();
        repo.insert(&record_for("b", 2)).await.unwrap();

        let a = repo.stats(Some("a")).await.unwrap();
        assert_eq!(a.total, 2);
        assert_eq!(a.queued, 2);

        let all = repo.stats(None).await.unwrap();
        assert_eq!(all.total, 3);
    }

    #[tokio::test]
    async fn test_stats_average_duration_over_completed() {
        let repo = MemoryTaskRepository::new();
        for duration in [json!(30.0), json!(15.0), json!(0)] {
            let record = record_for("a", 0);
            repo.insert(&record).await.unwrap();
            let processing = record.apply(Transition::Pickup, Utc::now()).unwrap();
            let done = processing
                .apply(
                    Transition::Complete(json!({"text": "", "duration": duration})),
                    Utc::now(),
                )
                .unwrap();
            repo.update_if_status(&processing, TaskStatus::Queued)
                .await
                .unwrap();
            repo.update_if_status(&done, TaskStatus::Processing)
                .await
                .unwrap();
        }
        repo.insert(&record_for("a", 1)).await.unwrap();

        let stats = repo.stats(Some("a")).await.unwrap();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.total_duration_sec, 45.0);
        assert_eq!(stats.avg_duration_sec, 15.0);

        let empty = repo.stats(Some("nobody")).await.unwrap();
        assert_eq!(empty.avg_duration_sec, 0.0);
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let repo = MemoryTaskRepository::new();
        repo.set_unavailable(true);
        let err = repo.insert(&record_for("a", 0)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(repo.stats(None).await.is_err());

        repo.set_unavailable(false);
        assert!(repo.insert(&record_for("a", 0)).await.is_ok());
    }
}
