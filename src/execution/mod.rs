//! Pipeline execution: runners, job executor, stage scheduling and the engine

pub mod engine;
pub mod events;
pub mod executor;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod supersede;

pub use engine::ExecutionEngine;
pub use events::{EventBus, EventHandler, ExecutionEvent};
pub use executor::{JobExecutor, JobOutcome};
pub use report::{JobReport, RunReport, StageReport};
pub use runner::{RunnerError, ScriptRunner, ShellRunner, StepOutput};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
pub use supersede::{CancelFlag, PipelineRegistry};
