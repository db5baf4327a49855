//! Execution state models

use crate::core::job::FailureClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Overall pipeline execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Pipeline has not started
    Pending,
    /// Pipeline is currently running
    Running,
    /// Every blocking job succeeded
    Succeeded,
    /// A non-allowed job failed
    Failed,
    /// Superseded or interrupted
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// State of a single job in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its stage or its needs
    Pending,
    /// Included by a manual rule; never started automatically
    Manual,
    Running {
        started_at: DateTime<Utc>,
        attempt: u32,
    },
    Succeeded {
        attempts: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    /// Failed after all retries; `allowed` failures do not block
    Failed {
        error: String,
        class: FailureClass,
        attempts: u32,
        allowed: bool,
        finished_at: DateTime<Utc>,
    },
    Cancelled {
        reason: String,
    },
    Skipped {
        reason: String,
    },
}

impl JobState {
    /// Check if the job will not change state again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded { .. }
                | JobState::Failed { .. }
                | JobState::Cancelled { .. }
                | JobState::Skipped { .. }
        )
    }

    /// Whether a `needs` edge on this job is satisfied
    pub fn satisfies_needs(&self) -> bool {
        matches!(self, JobState::Succeeded { .. } | JobState::Failed { allowed: true, .. })
    }

    /// Terminal state that holds back later stages
    pub fn is_blocking_failure(&self) -> bool {
        matches!(self, JobState::Failed { allowed: false, .. } | JobState::Cancelled { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            JobState::Running { attempt, .. } => *attempt,
            JobState::Succeeded { attempts, .. } | JobState::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Manual => "manual",
            JobState::Running { .. } => "running",
            JobState::Succeeded { .. } => "succeeded",
            JobState::Failed { allowed: true, .. } => "failed (allowed)",
            JobState::Failed { .. } => "failed",
            JobState::Cancelled { .. } => "cancelled",
            JobState::Skipped { .. } => "skipped",
        }
    }
}

/// Status of one stage group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    /// Only allowed-to-fail jobs failed
    PartiallyFailedAllowed,
    Failed,
    /// Not started because the run stopped earlier
    Skipped,
}

impl StageStatus {
    /// Later stages may start
    pub fn is_passing(&self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::PartiallyFailedAllowed)
    }
}

/// Overall pipeline state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Current execution status
    pub status: ExecutionStatus,

    /// When execution started
    pub started_at: Option<DateTime<Utc>>,

    /// When execution finished
    pub completed_at: Option<DateTime<Utc>>,

    /// Included jobs
    pub total_jobs: usize,

    pub succeeded_jobs: usize,

    pub failed_jobs: usize,

    pub running_jobs: usize,
}

impl PipelineState {
    /// Create a new pipeline state
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            total_jobs: 0,
            succeeded_jobs: 0,
            failed_jobs: 0,
            running_jobs: 0,
        }
    }

    /// Mark pipeline as started
    pub fn start(&mut self, total_jobs: usize) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
        self.total_jobs = total_jobs;
    }

    /// Mark pipeline as finished with the given status
    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Update job counts
    pub fn update_counts(&mut self, succeeded: usize, failed: usize, running: usize) {
        self.succeeded_jobs = succeeded;
        self.failed_jobs = failed;
        self.running_jobs = running;
    }

    /// Calculate progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.0;
        }
        (self.succeeded_jobs + self.failed_jobs) as f64 / self.total_jobs as f64
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}
