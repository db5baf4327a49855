//! Persistence layer for pipeline execution history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

pub use crate::core::ExecutionStatus;
use crate::core::JobGraph;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Summary of a pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Pipeline name
    pub pipeline_name: String,

    /// Ref the run was triggered for
    pub ref_name: String,

    /// Trigger source (push, schedule, ...)
    pub source: String,

    /// Execution status
    pub status: ExecutionStatus,

    /// When execution started
    pub started_at: DateTime<Utc>,

    /// When execution completed (if complete)
    pub completed_at: Option<DateTime<Utc>>,

    /// Progress (0.0 to 1.0)
    pub progress: f64,

    pub succeeded_jobs: usize,

    /// Failed or cancelled jobs, allowed failures included
    pub failed_jobs: usize,

    /// Total number of included jobs
    pub total_jobs: usize,
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a pipeline execution
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()>;

    /// Load an execution by ID
    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>>;

    /// List all executions for a pipeline, newest first
    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>>;

    /// Latest executions across all pipelines
    async fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionSummary>>;

    /// List all pipeline names
    async fn list_pipelines(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryPersistence {
    executions: tokio::sync::RwLock<std::collections::HashMap<Uuid, ExecutionSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sorted(&self, filter: impl Fn(&ExecutionSummary) -> bool) -> Vec<ExecutionSummary> {
        let execs = self.executions.read().await;
        let mut result: Vec<_> = execs.values().filter(|e| filter(e)).cloned().collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        result
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()> {
        let mut execs = self.executions.write().await;
        execs.insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>> {
        let execs = self.executions.read().await;
        Ok(execs.get(&execution_id).cloned())
    }

    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>> {
        Ok(self.sorted(|e| e.pipeline_name == pipeline_name).await)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionSummary>> {
        let mut all = self.sorted(|_| true).await;
        all.truncate(limit);
        Ok(all)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let execs = self.executions.read().await;
        let mut names: Vec<String> = execs.values().map(|e| e.pipeline_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Create a summary from a finished job graph
pub fn create_summary(graph: &JobGraph) -> ExecutionSummary {
    ExecutionSummary {
        execution_id: graph.state.execution_id,
        pipeline_name: graph.pipeline_name.clone(),
        ref_name: graph.trigger.ref_name().to_string(),
        source: graph.trigger.source().to_string(),
        status: graph.state.status,
        started_at: graph.state.started_at.unwrap_or_else(Utc::now),
        completed_at: graph.state.completed_at,
        progress: graph.state.progress(),
        succeeded_jobs: graph.state.succeeded_jobs,
        failed_jobs: graph.state.failed_jobs,
        total_jobs: graph.state.total_jobs,
    }
}
