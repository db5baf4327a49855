//! Run report - what happened to every job of a run

use crate::core::{
    job::FailureClass,
    pipeline::JobGraph,
    state::{ExecutionStatus, JobState, StageStatus},
};
use crate::publish::PublishReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub name: String,
    pub stage: String,
    pub state: String,
    pub attempts: u32,
    pub failure_class: Option<FailureClass>,
    pub error: Option<String>,
    pub allow_failure: bool,
    /// Masked output of all attempts
    pub log: String,
    pub publish: Option<PublishReport>,
}

/// Final report of a pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub execution_id: Uuid,
    pub pipeline: String,
    pub source: String,
    pub ref_name: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageReport>,
    pub jobs: Vec<JobReport>,
    pub excluded: Vec<String>,
    /// Allowed failures, surfaced without failing the run
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn from_graph(graph: &JobGraph) -> Self {
        let jobs: Vec<JobReport> = graph
            .nodes()
            .map(|node| {
                let (failure_class, error) = match &node.state {
                    JobState::Failed { class, error, .. } => (Some(*class), Some(error.clone())),
                    JobState::Cancelled { reason } => (Some(FailureClass::Cancelled), Some(reason.clone())),
                    JobState::Skipped { reason } => (None, Some(reason.clone())),
                    _ => (None, None),
                };
                JobReport {
                    name: node.job.name.clone(),
                    stage: node.job.stage.clone(),
                    state: node.state.label().to_string(),
                    attempts: node.state.attempts(),
                    failure_class,
                    error,
                    allow_failure: node.job.allow_failure,
                    log: node.log.clone(),
                    publish: node.publish.clone(),
                }
            })
            .collect();

        let warnings = graph
            .nodes()
            .filter_map(|node| match &node.state {
                JobState::Failed {
                    allowed: true,
                    error,
                    class,
                    ..
                } => Some(format!("{} failed ({}), allowed to fail: {}", node.job.name, class, error)),
                _ => None,
            })
            .collect();

        RunReport {
            execution_id: graph.state.execution_id,
            pipeline: graph.pipeline_name.clone(),
            source: graph.trigger.source().to_string(),
            ref_name: graph.trigger.ref_name().to_string(),
            status: graph.state.status,
            started_at: graph.state.started_at,
            completed_at: graph.state.completed_at,
            stages: graph
                .stages
                .iter()
                .filter(|s| !s.jobs.is_empty())
                .map(|s| StageReport {
                    name: s.name.clone(),
                    status: s.status,
                })
                .collect(),
            jobs,
            excluded: graph.excluded().to_vec(),
            warnings,
        }
    }

    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }

    pub fn duration_secs(&self) -> Option<i64> {
        Some((self.completed_at? - self.started_at?).num_seconds())
    }
}
