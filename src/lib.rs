//! railyard - a stage-ordered CI/CD pipeline runner

pub mod artifact;
pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod publish;

// Re-export commonly used types
pub use artifact::{ArtifactBundle, ArtifactStore};
pub use core::config::PipelineConfig;
pub use core::{ExecutionStatus, JobGraph, JobState, Pipeline, RawTrigger, TriggerContext};
pub use execution::{
    CancelFlag, ExecutionEngine, ExecutionEvent, JobExecutor, PipelineRegistry, RunReport, SchedulingStrategy,
    ScriptRunner, ShellRunner,
};
pub use publish::{Credentials, PublishConfig, PublishWorkflow};
