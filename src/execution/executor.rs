//! Job executor - runs one job's steps with retries

use crate::{
    artifact::{ArtifactBundle, ArtifactStore},
    core::{
        context::JobEnvironment,
        job::{FailureClass, JobAction, JobDefinition},
        trigger::TriggerContext,
    },
    execution::{
        events::{EventBus, ExecutionEvent},
        runner::ScriptRunner,
        supersede::CancelFlag,
    },
    publish::{PublishReport, PublishWorkflow},
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Final result of running a job
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded {
        attempts: u32,
        started_at: DateTime<Utc>,
        log: String,
        /// Captured, not yet stored
        bundle: Option<ArtifactBundle>,
        publish: Option<PublishReport>,
    },
    Failed {
        error: String,
        class: FailureClass,
        attempts: u32,
        log: String,
        publish: Option<PublishReport>,
    },
    Cancelled {
        reason: String,
        attempts: u32,
        log: String,
    },
}

/// Result of a single attempt
enum Attempt {
    Succeeded(Option<PublishReport>),
    Failed {
        error: String,
        class: FailureClass,
        publish: Option<PublishReport>,
    },
    Interrupted,
}

/// Executes single jobs
pub struct JobExecutor<R> {
    runner: R,
    artifacts: Arc<ArtifactStore>,
    publisher: Option<Arc<PublishWorkflow>>,
    workspace: PathBuf,
    events: EventBus,
}

impl<R: ScriptRunner> JobExecutor<R> {
    pub fn new(runner: R, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            runner,
            artifacts,
            publisher: None,
            workspace: PathBuf::from("."),
            events: EventBus::new(),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<PublishWorkflow>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Directory the steps run in
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    pub fn publisher(&self) -> Option<&Arc<PublishWorkflow>> {
        self.publisher.as_ref()
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Run a job to a final outcome
    ///
    /// Transient failures re-run the whole job while the retry policy
    /// allows, then end as script failures; script failures and
    /// configuration errors never re-run.
    pub async fn execute(
        &self,
        run: Uuid,
        job: &JobDefinition,
        env: &JobEnvironment,
        trigger: &TriggerContext,
        cancel: &CancelFlag,
    ) -> JobOutcome {
        let started_at = Utc::now();
        let mut log = String::new();
        let mut retries_used = 0;

        loop {
            let attempt = retries_used + 1;
            info!("Executing job: {} (attempt {})", job.name, attempt);
            self.events
                .emit(ExecutionEvent::JobStarted {
                    job: job.name.clone(),
                    attempt,
                })
                .await;

            match self.run_attempt(run, job, env, trigger, cancel, &mut log).await {
                Attempt::Succeeded(publish) => {
                    let bundle = self.capture_artifacts(run, job, env).await;
                    return JobOutcome::Succeeded {
                        attempts: attempt,
                        started_at,
                        log: env.mask(&log),
                        bundle,
                        publish,
                    };
                }
                Attempt::Interrupted => {
                    return JobOutcome::Cancelled {
                        reason: "pipeline cancelled".to_string(),
                        attempts: attempt,
                        log: env.mask(&log),
                    };
                }
                Attempt::Failed { error, class, publish } => {
                    if job.retry.should_retry(class, retries_used) && !cancel.is_raised() {
                        warn!(
                            "Job {} failed with {} ({}), retrying ({}/{})",
                            job.name,
                            class,
                            error,
                            retries_used + 1,
                            job.retry.max_retries
                        );
                        self.events
                            .emit(ExecutionEvent::JobRetrying {
                                job: job.name.clone(),
                                attempt: attempt + 1,
                                class,
                            })
                            .await;
                        retries_used += 1;
                        continue;
                    }

                    // Transient failures that earn no further retry end as script failures
                    let (error, class) = if class.is_transient() {
                        (
                            format!("{} persisted after {} attempt(s): {}", class, attempt, error),
                            FailureClass::ScriptFailure,
                        )
                    } else {
                        (error, class)
                    };

                    return JobOutcome::Failed {
                        error: env.mask(&error),
                        class,
                        attempts: attempt,
                        log: env.mask(&log),
                        publish,
                    };
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        run: Uuid,
        job: &JobDefinition,
        env: &JobEnvironment,
        trigger: &TriggerContext,
        cancel: &CancelFlag,
        log: &mut String,
    ) -> Attempt {
        let bundles = self.artifacts.visible_to(run, job, Utc::now()).await;
        if let Err(e) = self.artifacts.restore(&bundles, &self.workspace).await {
            warn!("Job {}: failed to restore artifacts: {}", job.name, e);
        }

        let result = match job.action {
            JobAction::Script => self.run_script(job, env, cancel, log).await,
            JobAction::PublishImage => match &self.publisher {
                Some(p) => match p.publish_image(env, trigger, &bundles, &self.workspace).await {
                    Ok(report) => {
                        log.push_str(&format!("pushed {}: {}\n", report.target, report.pushed.join(", ")));
                        Attempt::Succeeded(Some(report))
                    }
                    Err(e) => Attempt::Failed {
                        error: e.to_string(),
                        class: e.class(),
                        publish: e.report().cloned(),
                    },
                },
                None => missing_publisher(),
            },
            JobAction::PublishDescription => match &self.publisher {
                Some(p) => match p.publish_description(env, trigger, &self.workspace).await {
                    Ok(report) => {
                        log.push_str(&format!("updated description of {}\n", report.target));
                        Attempt::Succeeded(Some(report))
                    }
                    Err(e) => Attempt::Failed {
                        error: e.to_string(),
                        class: e.class(),
                        publish: None,
                    },
                },
                None => missing_publisher(),
            },
        };

        self.run_after_script(job, env, log).await;
        result
    }

    /// Run steps in order, stopping at the first failure
    async fn run_script(
        &self,
        job: &JobDefinition,
        env: &JobEnvironment,
        cancel: &CancelFlag,
        log: &mut String,
    ) -> Attempt {
        for (index, step) in job.script.iter().enumerate() {
            if job.interruptible && cancel.is_raised() {
                info!("Job {} interrupted before step {}", job.name, index + 1);
                return Attempt::Interrupted;
            }

            log.push_str(&format!("$ {}\n", step));
            match self.runner.run(step, &env.variables, &self.workspace).await {
                Ok(output) => {
                    log.push_str(&output.output);
                    if !output.success() {
                        return Attempt::Failed {
                            error: format!("step {} `{}` exited with code {}", index + 1, step, output.exit_code),
                            class: FailureClass::ScriptFailure,
                            publish: None,
                        };
                    }
                }
                Err(e) => {
                    log.push_str(&format!("{}\n", e));
                    return Attempt::Failed {
                        error: e.to_string(),
                        class: e.class(),
                        publish: None,
                    };
                }
            }
        }

        Attempt::Succeeded(None)
    }

    /// After-steps always run; their failures never change the job status
    async fn run_after_script(&self, job: &JobDefinition, env: &JobEnvironment, log: &mut String) {
        for step in &job.after_script {
            log.push_str(&format!("$ {}\n", step));
            match self.runner.run(step, &env.variables, &self.workspace).await {
                Ok(output) => {
                    log.push_str(&output.output);
                    if !output.success() {
                        warn!("Job {}: after-script step exited with code {}", job.name, output.exit_code);
                    }
                }
                Err(e) => warn!("Job {}: after-script step failed: {}", job.name, e),
            }
        }
    }

    async fn capture_artifacts(&self, run: Uuid, job: &JobDefinition, env: &JobEnvironment) -> Option<ArtifactBundle> {
        let spec = job.artifacts.as_ref()?;
        let name = env.expand(&spec.name);
        debug!("Capturing artifacts of {} as {}", job.name, name);

        match self.artifacts.capture(run, job, &name, spec, &self.workspace).await {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!("Job {}: artifact capture failed, no bundle stored: {}", job.name, e);
                None
            }
        }
    }
}

fn missing_publisher() -> Attempt {
    Attempt::Failed {
        error: "pipeline has no publish settings".to_string(),
        class: FailureClass::Configuration,
        publish: None,
    }
}
