//! SQLite-based persistence store

use crate::persistence::{ExecutionStatus, ExecutionSummary, PersistenceBackend};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

const COLUMNS: &str = "id, pipeline_name, ref_name, source, status, started_at, completed_at, \
                       progress, succeeded_jobs, failed_jobs, total_jobs";

/// SQLite execution store
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Create a new SQLite store
    pub async fn new(db_path: &str) -> Result<Self> {
        // An in-memory database lives per connection
        let (url, max_connections) = if db_path == ":memory:" {
            ("sqlite::memory:".to_string(), 1)
        } else {
            (format!("sqlite:{}?mode=rwc", db_path), 4)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("railyard");
        std::fs::create_dir_all(&db_dir)?;

        let db_path = db_dir.join("executions.db");
        let db_path = db_path
            .to_str()
            .ok_or_else(|| anyhow!("Database path is not valid UTF-8: {}", db_path.display()))?;
        Self::new(db_path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                ref_name TEXT NOT NULL,
                source TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                progress REAL NOT NULL DEFAULT 0.0,
                succeeded_jobs INTEGER NOT NULL DEFAULT 0,
                failed_jobs INTEGER NOT NULL DEFAULT 0,
                total_jobs INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_pipeline_name ON executions(pipeline_name);
            CREATE INDEX IF NOT EXISTS idx_ref_name ON executions(ref_name);
            CREATE INDEX IF NOT EXISTS idx_started_at ON executions(started_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn from_row(row: &SqliteRow) -> Result<ExecutionSummary> {
        let status: String = row.get("status");
        Ok(ExecutionSummary {
            execution_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            pipeline_name: row.get("pipeline_name"),
            ref_name: row.get("ref_name"),
            source: row.get("source"),
            status: status.parse::<ExecutionStatus>().map_err(|e| anyhow!(e))?,
            started_at: Self::from_naive(row.get("started_at")),
            completed_at: row
                .get::<Option<NaiveDateTime>, _>("completed_at")
                .map(Self::from_naive),
            progress: row.get("progress"),
            succeeded_jobs: row.get::<i64, _>("succeeded_jobs") as usize,
            failed_jobs: row.get::<i64, _>("failed_jobs") as usize,
            total_jobs: row.get::<i64, _>("total_jobs") as usize,
        })
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteExecutionStore {
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO executions
            (id, pipeline_name, ref_name, source, status, started_at, completed_at,
             progress, succeeded_jobs, failed_jobs, total_jobs)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(execution.execution_id.to_string())
        .bind(&execution.pipeline_name)
        .bind(&execution.ref_name)
        .bind(&execution.source)
        .bind(execution.status.as_str())
        .bind(execution.started_at.naive_utc())
        .bind(execution.completed_at.map(|dt| dt.naive_utc()))
        .bind(execution.progress)
        .bind(execution.succeeded_jobs as i64)
        .bind(execution.failed_jobs as i64)
        .bind(execution.total_jobs as i64)
        .execute(&self.pool)
        .await
        .context("Failed to save execution")?;

        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>> {
        let row = sqlx::query(&format!("SELECT {} FROM executions WHERE id = ?1", COLUMNS))
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load execution")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM executions WHERE pipeline_name = ?1 ORDER BY started_at DESC",
            COLUMNS
        ))
        .bind(pipeline_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM executions ORDER BY started_at DESC LIMIT ?1",
            COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT pipeline_name FROM executions ORDER BY pipeline_name ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list pipelines")?;

        Ok(rows.iter().map(|row| row.get("pipeline_name")).collect())
    }
}
