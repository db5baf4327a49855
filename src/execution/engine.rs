//! Main execution engine - drives a job graph stage by stage

use crate::{
    core::{
        job::FailureClass,
        pipeline::JobGraph,
        state::{ExecutionStatus, JobState, StageStatus},
    },
    execution::{
        events::{EventBus, ExecutionEvent},
        executor::{JobExecutor, JobOutcome},
        report::RunReport,
        runner::ScriptRunner,
        scheduler::{ExecutionScheduler, SchedulingStrategy},
        supersede::{CancelFlag, PipelineRegistry},
    },
};
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const CANCELLED_REASON: &str = "pipeline cancelled";

/// Main pipeline execution engine
pub struct ExecutionEngine<R> {
    scheduler: ExecutionScheduler,
    executor: Arc<JobExecutor<R>>,
}

impl<R: ScriptRunner + 'static> ExecutionEngine<R> {
    pub fn new(executor: JobExecutor<R>, strategy: SchedulingStrategy) -> Self {
        Self {
            scheduler: ExecutionScheduler::new(strategy),
            executor: Arc::new(executor),
        }
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events().subscribe(handler).await;
    }

    pub fn executor(&self) -> &JobExecutor<R> {
        &self.executor
    }

    fn events(&self) -> &EventBus {
        self.executor.events()
    }

    /// Run the graph as the newest pipeline of its ref
    ///
    /// Any older run on the same ref registered with `registry` is asked to stop.
    pub async fn run(&self, graph: &mut JobGraph, registry: &PipelineRegistry) -> RunReport {
        let ref_name = graph.trigger.ref_name().to_string();
        let execution_id = graph.state.execution_id;
        let cancel = registry.register(&ref_name, execution_id).await;
        let report = self.execute(graph, &cancel).await;
        registry.finish(&ref_name, execution_id).await;
        report
    }

    /// Execute the entire pipeline
    ///
    /// Stages run strictly in order. A stage with a failed job that is not
    /// allowed to fail stops every later stage from starting.
    pub async fn execute(&self, graph: &mut JobGraph, cancel: &CancelFlag) -> RunReport {
        if let Some(publisher) = self.executor.publisher() {
            for secret in publisher.secrets() {
                graph.register_secret(&secret);
            }
        }

        let purged = self.executor.artifacts().purge_expired(Utc::now()).await;
        if purged > 0 {
            debug!("Purged {} expired artifact bundles", purged);
        }

        let execution_id = graph.state.execution_id;
        info!(
            "Starting pipeline execution: {} ({}) on {} [{}]",
            graph.pipeline_name,
            execution_id,
            graph.trigger.ref_name(),
            graph.trigger.source()
        );
        graph.state.start(graph.len());
        self.events()
            .emit(ExecutionEvent::PipelineStarted {
                execution_id,
                pipeline_name: graph.pipeline_name.clone(),
                total_jobs: graph.len(),
            })
            .await;

        let mut halted = false;
        let mut interrupted = false;

        for index in 0..graph.stages.len() {
            if graph.stages[index].jobs.is_empty() {
                continue;
            }

            if cancel.is_raised() {
                interrupted = true;
                self.settle_pending(graph, index, CANCELLED_REASON, true).await;
                graph.stages[index].status = StageStatus::Skipped;
                continue;
            }
            if halted {
                self.settle_pending(graph, index, "an earlier stage failed", false).await;
                graph.stages[index].status = StageStatus::Skipped;
                continue;
            }

            let stage_name = graph.stages[index].name.clone();
            info!("Starting stage: {}", stage_name);
            self.events()
                .emit(ExecutionEvent::StageStarted {
                    stage: stage_name.clone(),
                })
                .await;

            interrupted |= self.run_stage(graph, index, cancel).await;

            let status = graph.stage_status(index);
            graph.stages[index].status = status;
            self.events()
                .emit(ExecutionEvent::StageFinished {
                    stage: stage_name.clone(),
                    status,
                })
                .await;

            if status == StageStatus::Failed {
                warn!("Stage {} failed, later stages will not start", stage_name);
                halted = true;
            }
            Self::update_counts(graph);
        }

        let status = if interrupted {
            ExecutionStatus::Cancelled
        } else if halted {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Succeeded
        };

        Self::update_counts(graph);
        graph.state.finish(status);
        info!("Pipeline execution finished: {} - {}", graph.pipeline_name, status);
        self.events()
            .emit(ExecutionEvent::PipelineCompleted { execution_id, status })
            .await;

        RunReport::from_graph(graph)
    }

    /// Run one stage to completion; returns whether cancellation cut it short
    async fn run_stage(&self, graph: &mut JobGraph, stage: usize, cancel: &CancelFlag) -> bool {
        let mut tasks: JoinSet<(String, JobOutcome)> = JoinSet::new();
        let mut interrupted = false;

        loop {
            for (job, reason) in graph.blocked_jobs(stage) {
                self.skip_job(graph, &job, reason).await;
            }

            if cancel.is_raised() {
                interrupted = true;
                self.settle_pending(graph, stage, CANCELLED_REASON, true).await;
            } else {
                for name in self.scheduler.next_jobs(graph, stage) {
                    self.start_job(graph, &name, cancel, &mut tasks);
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((name, outcome)) => {
                    if matches!(outcome, JobOutcome::Cancelled { .. }) {
                        interrupted = true;
                    }
                    self.apply_outcome(graph, &name, outcome).await;
                }
                Err(e) => error!("Job task failed to join: {}", e),
            }
            Self::update_counts(graph);
        }

        // Nothing left running; whatever is still open can never start
        self.settle_pending(graph, stage, "needs can not be satisfied", false).await;
        let lost: Vec<String> = graph
            .running_jobs()
            .iter()
            .filter(|n| n.job.stage_index == stage)
            .map(|n| n.job.name.clone())
            .collect();
        for name in lost {
            let outcome = JobOutcome::Failed {
                error: "job task was lost".to_string(),
                class: FailureClass::UnknownFailure,
                attempts: 1,
                log: String::new(),
                publish: None,
            };
            self.apply_outcome(graph, &name, outcome).await;
        }

        interrupted
    }

    /// Mark a job running and spawn it
    ///
    /// The job runs in its own task so a panic surfaces as a failed job
    /// instead of tearing down the run.
    fn start_job(
        &self,
        graph: &mut JobGraph,
        name: &str,
        cancel: &CancelFlag,
        tasks: &mut JoinSet<(String, JobOutcome)>,
    ) {
        let trigger = graph.trigger.clone();
        let run = graph.state.execution_id;
        let Some(node) = graph.node_mut(name) else {
            return;
        };
        node.state = JobState::Running {
            started_at: Utc::now(),
            attempt: 1,
        };

        let job = Arc::clone(&node.job);
        let env = node.environment.clone();
        let executor = Arc::clone(&self.executor);
        let cancel = cancel.clone();
        let name = name.to_string();

        tasks.spawn(async move {
            let handle = tokio::spawn(async move { executor.execute(run, &job, &env, &trigger, &cancel).await });
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => JobOutcome::Failed {
                    error: format!("job task panicked: {}", e),
                    class: FailureClass::UnknownFailure,
                    attempts: 1,
                    log: String::new(),
                    publish: None,
                },
            };
            (name, outcome)
        });
    }

    async fn apply_outcome(&self, graph: &mut JobGraph, name: &str, outcome: JobOutcome) {
        let finished_at = Utc::now();
        let event = match outcome {
            JobOutcome::Succeeded {
                attempts,
                started_at,
                log,
                bundle,
                publish,
            } => {
                if let Some(bundle) = bundle {
                    if let Err(e) = self.executor.artifacts().put(bundle).await {
                        warn!("Job {}: could not store artifacts: {}", name, e);
                    }
                }
                if let Some(node) = graph.node_mut(name) {
                    node.state = JobState::Succeeded {
                        attempts,
                        started_at,
                        finished_at,
                    };
                    node.log = log;
                    node.publish = publish;
                }
                info!("Job {} succeeded after {} attempt(s)", name, attempts);
                ExecutionEvent::JobSucceeded {
                    job: name.to_string(),
                    attempts,
                }
            }
            JobOutcome::Failed {
                error,
                class,
                attempts,
                log,
                publish,
            } => {
                let Some(node) = graph.node_mut(name) else {
                    return;
                };
                let allowed = node.job.allow_failure;
                if allowed {
                    warn!("Job {} failed ({}), allowed to fail: {}", name, class, error);
                } else {
                    error!("Job {} failed ({}): {}", name, class, error);
                }
                node.state = JobState::Failed {
                    error: error.clone(),
                    class,
                    attempts,
                    allowed,
                    finished_at,
                };
                node.log = log;
                node.publish = publish;
                ExecutionEvent::JobFailed {
                    job: name.to_string(),
                    error,
                    class,
                    allowed,
                }
            }
            JobOutcome::Cancelled { reason, log, .. } => {
                self.executor.artifacts().discard(graph.state.execution_id, name).await;
                if let Some(node) = graph.node_mut(name) {
                    node.state = JobState::Cancelled { reason: reason.clone() };
                    node.log = log;
                }
                info!("Job {} cancelled: {}", name, reason);
                ExecutionEvent::JobCancelled {
                    job: name.to_string(),
                    reason,
                }
            }
        };

        self.events().emit(event).await;
    }

    async fn skip_job(&self, graph: &mut JobGraph, name: &str, reason: String) {
        if let Some(node) = graph.node_mut(name) {
            node.state = JobState::Skipped { reason: reason.clone() };
        }
        debug!("Job {} skipped: {}", name, reason);
        self.events()
            .emit(ExecutionEvent::JobSkipped {
                job: name.to_string(),
                reason,
            })
            .await;
    }

    /// Close every pending job of a stage without running it
    async fn settle_pending(&self, graph: &mut JobGraph, stage: usize, reason: &str, cancelled: bool) {
        let pending: Vec<String> = graph.stages[stage]
            .jobs
            .iter()
            .filter(|name| graph.node(name).is_some_and(|n| matches!(n.state, JobState::Pending)))
            .cloned()
            .collect();

        for name in pending {
            if cancelled {
                if let Some(node) = graph.node_mut(&name) {
                    node.state = JobState::Cancelled {
                        reason: reason.to_string(),
                    };
                }
                self.events()
                    .emit(ExecutionEvent::JobCancelled {
                        job: name,
                        reason: reason.to_string(),
                    })
                    .await;
            } else {
                self.skip_job(graph, &name, reason.to_string()).await;
            }
        }
    }

    fn update_counts(graph: &mut JobGraph) {
        let (mut succeeded, mut failed, mut running) = (0, 0, 0);
        for node in graph.nodes() {
            match node.state {
                JobState::Succeeded { .. } => succeeded += 1,
                JobState::Failed { .. } | JobState::Cancelled { .. } => failed += 1,
                JobState::Running { .. } => running += 1,
                _ => {}
            }
        }
        graph.state.update_counts(succeeded, failed, running);
    }
}
