//! # vocalis-db
//!
//! Durable storage for vocalis task records.
//!
//! This crate provides:
//! - Connection pool management
//! - `PgTaskRepository`, the PostgreSQL `TaskRepository`
//! - `MemoryTaskRepository`, an in-process `TaskRepository`
//! - SQL migrations (behind the `migrations` feature)
//!
//! ## Example
//!
//! ```rust,ignore
//! use vocalis_db::Database;
//! use vocalis_core::TaskRepository;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/vocalis").await?;
//!     db.migrate().await?;
//!
//!     let stats = db.tasks.stats(None).await?;
//!     println!("{} tasks recorded", stats.total);
//!     Ok(())
//! }
//! ```

pub mod memory;
pub mod pool;
pub mod tasks;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

pub use memory::MemoryTaskRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use tasks::PgTaskRepository;
pub use vocalis_core::{Error, Result, TaskRepository};

/// Database handle bundling the pool and its repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Task record repository.
    pub tasks: PgTaskRepository,
}

impl Database {
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            tasks: PgTaskRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect with the default pool configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
