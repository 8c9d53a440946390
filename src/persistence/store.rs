//! SQLite-based persistence store

use crate::persistence::{ExecutionStatus, ExecutionSummary, PersistenceBackend};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// SQLite execution store
///
/// Filterable fields live in their own columns; the full summary, step log
/// included, is kept as JSON.
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        Self::connect(options).await
    }

    /// A database that lives as long as the store
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options).await
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        Self::open(&Self::default_path()).await
    }

    /// `<local data dir>/dockhand/history.db`
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dockhand")
            .join("history.db")
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        // One long-lived connection; an in-memory database dies with it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                status TEXT NOT NULL,
                git_ref TEXT NOT NULL,
                sha TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                completed_steps INTEGER NOT NULL DEFAULT 0,
                failed_steps INTEGER NOT NULL DEFAULT 0,
                total_steps INTEGER NOT NULL DEFAULT 0,
                summary_json TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_pipeline_name ON runs(pipeline_name);
            CREATE INDEX IF NOT EXISTS idx_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_started_at ON runs(started_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize schema")?;

        Ok(())
    }

    /// Fixed-width timestamps so text order is time order
    fn timestamp(dt: DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionSummary> {
        let json: String = row.get("summary_json");
        let mut summary: ExecutionSummary =
            serde_json::from_str(&json).context("Corrupt run summary")?;

        // The status column is authoritative
        let status: String = row.get("status");
        if let Some(status) = ExecutionStatus::parse(&status) {
            summary.status = status;
        }
        Ok(summary)
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteExecutionStore {
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()> {
        let json = serde_json::to_string(execution)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO runs
            (id, pipeline_name, status, git_ref, sha, started_at, completed_at,
             completed_steps, failed_steps, total_steps, summary_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(execution.execution_id.to_string())
        .bind(&execution.pipeline_name)
        .bind(execution.status.as_str())
        .bind(&execution.event.git_ref)
        .bind(&execution.event.sha)
        .bind(Self::timestamp(execution.started_at))
        .bind(execution.completed_at.map(Self::timestamp))
        .bind(execution.completed_steps as i64)
        .bind(execution.failed_steps as i64)
        .bind(execution.total_steps as i64)
        .bind(json)
        .execute(&self.pool)
        .await
        .context("Failed to save execution")?;

        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>> {
        let row = sqlx::query("SELECT status, summary_json FROM runs WHERE id = ?1")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load execution")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT status, summary_json
            FROM runs
            WHERE pipeline_name = ?1
            ORDER BY started_at DESC
            "#,
        )
        .bind(pipeline_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn latest_execution(&self, pipeline_name: &str) -> Result<Option<ExecutionSummary>> {
        let row = sqlx::query(
            r#"
            SELECT status, summary_json
            FROM runs
            WHERE pipeline_name = ?1
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(pipeline_name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get latest execution")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT pipeline_name
            FROM runs
            ORDER BY pipeline_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pipelines")?;

        Ok(rows.iter().map(|row| row.get("pipeline_name")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FailurePolicy, PipelineError, StepResult};
    use crate::persistence::create_summary;
    use crate::persistence::test_support::finished_run;

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();

        let mut ctx = finished_run("backend", ExecutionStatus::Failed);
        let now = Utc::now();
        ctx.record(StepResult {
            step_id: "login".to_string(),
            name: "Log in".to_string(),
            started_at: now,
            completed_at: now,
            exit_code: None,
            success: false,
            policy: FailurePolicy::Abort,
            output: String::new(),
            outputs: Default::default(),
            error: Some(PipelineError::AuthError("denied".to_string())),
        });
        let summary = create_summary(&ctx);

        store.save_execution(&summary).await.unwrap();

        let loaded = store
            .load_execution(summary.execution_id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(loaded.pipeline_name, "backend");
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(
            loaded.failure,
            Some(PipelineError::AuthError("denied".to_string()))
        );
        assert_eq!(loaded.event.sha, "abc123");
    }

    #[tokio::test]
    async fn test_sqlite_listing() {
        let store = SqliteExecutionStore::in_memory().await.unwrap();

        let older = finished_run("frontend", ExecutionStatus::Succeeded);
        let mut newer = finished_run("frontend", ExecutionStatus::Failed);
        newer.started_at = older.started_at + chrono::Duration::seconds(5);

        store.save_execution(&create_summary(&older)).await.unwrap();
        store.save_execution(&create_summary(&newer)).await.unwrap();
        store
            .save_execution(&create_summary(&finished_run("backend", ExecutionStatus::Succeeded)))
            .await
            .unwrap();

        let runs = store.list_executions("frontend").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].execution_id, newer.run_id);

        let latest = store.latest_execution("frontend").await.unwrap().unwrap();
        assert_eq!(latest.status, ExecutionStatus::Failed);
        assert_eq!(store.list_pipelines().await.unwrap(), vec!["backend", "frontend"]);
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");

        let store = SqliteExecutionStore::open(&path).await.unwrap();
        store
            .save_execution(&create_summary(&finished_run("backend", ExecutionStatus::Succeeded)))
            .await
            .unwrap();

        assert!(path.exists());
    }
}
