//! Persistence layer for pipeline run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

pub use crate::core::ExecutionStatus;
use crate::core::{Artifact, Event, PipelineError, RunContext, StepResult};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Summary of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Unique run ID
    pub execution_id: Uuid,

    /// Pipeline name
    pub pipeline_name: String,

    /// Terminal status
    pub status: ExecutionStatus,

    /// Event that triggered the run
    pub event: Event,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run completed (if complete)
    pub completed_at: Option<DateTime<Utc>>,

    /// Progress (0.0 to 1.0)
    pub progress: f64,

    /// Number of succeeded steps
    pub completed_steps: usize,

    /// Number of failed steps
    pub failed_steps: usize,

    /// Total number of steps
    pub total_steps: usize,

    /// Artifact the run produced
    #[serde(default)]
    pub artifact: Option<Artifact>,

    /// Registry references the run pushed
    #[serde(default)]
    pub images: Vec<String>,

    /// The error that aborted the run, if any
    #[serde(default)]
    pub failure: Option<PipelineError>,

    /// Step log in execution order
    #[serde(default)]
    pub steps: Vec<StepResult>,
}

impl ExecutionSummary {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at
            .map(|completed| completed.signed_duration_since(self.started_at))
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a run
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>>;

    /// List runs of a pipeline, newest first
    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>>;

    /// Most recent run of a pipeline
    async fn latest_execution(&self, pipeline_name: &str) -> Result<Option<ExecutionSummary>> {
        Ok(self.list_executions(pipeline_name).await?.into_iter().next())
    }

    /// List all pipeline names, sorted
    async fn list_pipelines(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
pub struct InMemoryPersistence {
    executions: tokio::sync::RwLock<std::collections::HashMap<Uuid, ExecutionSummary>>,
    by_pipeline: tokio::sync::RwLock<std::collections::HashMap<String, Vec<Uuid>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            executions: tokio::sync::RwLock::new(std::collections::HashMap::new()),
            by_pipeline: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()> {
        let mut execs = self.executions.write().await;
        let replaced = execs
            .insert(execution.execution_id, execution.clone())
            .is_some();

        if !replaced {
            let mut by_pipeline = self.by_pipeline.write().await;
            by_pipeline
                .entry(execution.pipeline_name.clone())
                .or_default()
                .push(execution.execution_id);
        }

        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>> {
        let execs = self.executions.read().await;
        Ok(execs.get(&execution_id).cloned())
    }

    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>> {
        let execs = self.executions.read().await;
        let by_pipeline = self.by_pipeline.read().await;

        let mut result: Vec<ExecutionSummary> = by_pipeline
            .get(pipeline_name)
            .map(|ids| ids.iter().filter_map(|id| execs.get(id).cloned()).collect())
            .unwrap_or_default();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let by_pipeline = self.by_pipeline.read().await;
        let mut names: Vec<String> = by_pipeline.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Create a summary from a finished run
pub fn create_summary(ctx: &RunContext) -> ExecutionSummary {
    let progress = if ctx.total_steps == 0 {
        1.0
    } else {
        ctx.results.len() as f64 / ctx.total_steps as f64
    };

    ExecutionSummary {
        execution_id: ctx.run_id,
        pipeline_name: ctx.pipeline_name.clone(),
        status: ctx.status,
        event: ctx.event.clone(),
        started_at: ctx.started_at,
        completed_at: ctx.completed_at,
        progress,
        completed_steps: ctx.succeeded_steps(),
        failed_steps: ctx.failed_steps(),
        total_steps: ctx.total_steps,
        artifact: ctx.artifact.clone(),
        images: ctx.images.clone(),
        failure: ctx.aborting_result().and_then(|r| r.error.clone()),
        steps: ctx.results.clone(),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::finished_run;
    use super::*;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryPersistence::new();
        let mut ctx = finished_run("backend", ExecutionStatus::Succeeded);
        ctx.images.push("ghcr.io/acme/api:abc123".to_string());

        let summary = create_summary(&ctx);
        store.save_execution(&summary).await.unwrap();
        // Saving again replaces instead of duplicating
        store.save_execution(&summary).await.unwrap();

        let loaded = store.load_execution(ctx.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Succeeded);
        assert_eq!(loaded.images, vec!["ghcr.io/acme/api:abc123"]);
        assert_eq!(store.list_executions("backend").await.unwrap().len(), 1);
        assert!(store.load_execution(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let store = InMemoryPersistence::new();
        let older = finished_run("frontend", ExecutionStatus::Failed);
        let mut newer = finished_run("frontend", ExecutionStatus::Succeeded);
        newer.started_at = older.started_at + chrono::Duration::seconds(5);

        store.save_execution(&create_summary(&older)).await.unwrap();
        store.save_execution(&create_summary(&newer)).await.unwrap();
        store
            .save_execution(&create_summary(&finished_run("backend", ExecutionStatus::Succeeded)))
            .await
            .unwrap();

        let runs = store.list_executions("frontend").await.unwrap();
        assert_eq!(runs[0].execution_id, newer.run_id);
        let latest = store.latest_execution("frontend").await.unwrap().unwrap();
        assert_eq!(latest.execution_id, newer.run_id);
        assert_eq!(store.list_pipelines().await.unwrap(), vec!["backend", "frontend"]);
    }

    #[test]
    fn test_summary_of_empty_run_is_complete() {
        let summary = create_summary(&finished_run("backend", ExecutionStatus::Succeeded));
        assert_eq!(summary.progress, 1.0);
        assert!(summary.failure.is_none());
        assert!(summary.duration().is_some());
    }
}
