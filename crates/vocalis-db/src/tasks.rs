//! Task repository implementation.

use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, error};

use vocalis_core::{
    Error, ModelSize, Result, TaskId, TaskPage, TaskQuery, TaskRecord, TaskRepository,
    TaskStats, TaskStatus,
};

const TASK_COLUMNS: &str = "id, owner, status, filename, model_size, language, \
     diarization_enabled, input_path, staged, result, error_message, replay_required, \
     duration_sec, created_at, started_at, completed_at";

/// PostgreSQL implementation of TaskRepository.
#[derive(Clone)]
pub struct PgTaskRepository {
    pool: Pool<Postgres>,
}

impl PgTaskRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_task_row(row: sqlx::postgres::PgRow) -> Result<TaskRecord> {
        let status: String = row.get("status");
        let model_size: String = row.get("model_size");
        Ok(TaskRecord {
            id: row.get("id"),
            owner: row.get("owner"),
            status: TaskStatus::from_str(&status)?,
            filename: row.get("filename"),
            model_size: ModelSize::from_str(&model_size)
                .map_err(|e| Error::Internal(format!("stored model_size: {}", e)))?,
            language: row.get("language"),
            diarization_enabled: row.get("diarization_enabled"),
            input_path: row.get("input_path"),
            staged: row.get("staged"),
            result: row.get("result"),
            error_message: row.get("error_message"),
            replay_required: row.get("replay_required"),
            duration_sec: row.get("duration_sec"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn insert(&self, record: &TaskRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO transcription_task
                (id, owner, status, filename, model_size, language, diarization_enabled,
                 input_path, staged, result, error_message, replay_required,
                 duration_sec, created_at, started_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(record.id)
        .bind(&record.owner)
        .bind(record.status.as_str())
        .bind(&record.filename)
        .bind(record.model_size.as_str())
        .bind(&record.language)
        .bind(record.diarization_enabled)
        .bind(&record.input_path)
        .bind(record.staged)
        .bind(&record.result)
        .bind(&record.error_message)
        .bind(record.replay_required)
        .bind(record.duration_sec)
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(
                subsystem = "db",
                component = "tasks",
                op = "insert",
                task_id = %record.id,
                error = %e,
                "Failed to insert task record"
            );
            Error::Database(e)
        })?;
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transcription_task WHERE id = $1",
            TASK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_task_row).transpose()
    }

    async fn update_if_status(&self, record: &TaskRecord, expected: TaskStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transcription_task
             SET status = $2, result = $3, error_message = $4, replay_required = $5,
                 started_at = $6, completed_at = $7, duration_sec = $8
             WHERE id = $1 AND status = $9",
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(&record.result)
        .bind(&record.error_message)
        .bind(record.replay_required)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.duration_sec)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn query_by_owner(&self, query: &TaskQuery) -> Result<TaskPage> {
        let start = Instant::now();
        let status = query.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transcription_task
             WHERE owner = $1 AND ($2::text IS NULL OR status = $2)",
        )
        .bind(&query.owner)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM transcription_task
             WHERE owner = $1 AND ($2::text IS NULL OR status = $2)
             ORDER BY created_at DESC, id DESC
             LIMIT $3 OFFSET $4",
            TASK_COLUMNS
        ))
        .bind(&query.owner)
        .bind(status)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let records = rows
            .into_iter()
            .map(Self::parse_task_row)
            .collect::<Result<Vec<_>>>()?;

        debug!(
            subsystem = "db",
            component = "tasks",
            op = "query_by_owner",
            result_count = records.len(),
            total,
            duration_ms = start.elapsed().as_millis() as u64,
            "History query"
        );

        Ok(TaskPage { records, total })
    }

    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transcription_task
             WHERE status IN ('queued', 'processing')
             ORDER BY created_at ASC, id ASC",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_task_row).collect()
    }

    async fn stats(&self, owner: Option<&str>) -> Result<TaskStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM transcription_task
             WHERE ($1::text IS NULL OR owner = $1)
             GROUP BY status",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let total_duration: f64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(duration_sec), 0)::float8 FROM transcription_task
             WHERE ($1::text IS NULL OR owner = $1)",
        )
        .bind(owner)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut stats = TaskStats::default();
        for (status, count) in rows {
            stats.add(TaskStatus::from_str(&status)?, count);
        }
        Ok(stats.with_total_duration(total_duration))
    }
}
