//! Test utility functions for railyard
#![allow(dead_code)]

use railyard::artifact::ArtifactStore;
use railyard::core::config::PipelineConfig;
use railyard::core::{ExecutionStatus, JobGraph, JobState, Pipeline, RawTrigger, TriggerContext};
use railyard::execution::{
    CancelFlag, ExecutionEngine, ExecutionEvent, JobExecutor, PipelineRegistry, RunReport, RunnerError,
    SchedulingStrategy, ScriptRunner, StepOutput,
};
use railyard::publish::{
    BuilderError, Credentials, DescriptionError, DescriptionPublisher, ImageBuilder, PublishConfig, PublishSpec,
    PublishWorkflow,
};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// One recorded script step
#[derive(Debug, Clone)]
pub struct RunnerCall {
    pub job: String,
    pub command: String,
}

/// Mock runner that replays scripted results per command
///
/// Unknown commands exit 0. The last scripted result of a command repeats.
#[derive(Default)]
pub struct MockRunner {
    results: Mutex<HashMap<String, VecDeque<Result<i32, RunnerError>>>>,
    files: Mutex<HashMap<String, Vec<PathBuf>>>,
    delays: Mutex<HashMap<String, Duration>>,
    hooks: Mutex<HashMap<String, Arc<dyn Fn() + Send + Sync>>>,
    calls: Mutex<Vec<RunnerCall>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results returned by successive runs of `command`
    pub fn on(self, command: &str, results: Vec<Result<i32, RunnerError>>) -> Self {
        self.results
            .lock()
            .unwrap()
            .insert(command.to_string(), results.into_iter().collect());
        self
    }

    pub fn failing(self, command: &str) -> Self {
        self.on(command, vec![Ok(1)])
    }

    /// `command` writes `path` (relative to the workdir) when it runs
    pub fn creates(self, command: &str, path: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push(PathBuf::from(path));
        self
    }

    pub fn slow(self, command: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(command.to_string(), delay);
        self
    }

    /// Call `hook` whenever `command` runs
    pub fn hook(self, command: &str, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.lock().unwrap().insert(command.to_string(), Arc::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    /// Jobs in the order their first step ran
    pub fn job_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for call in self.calls() {
            if !order.contains(&call.job) {
                order.push(call.job);
            }
        }
        order
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| c.command == command).count()
    }
}

#[async_trait]
impl ScriptRunner for MockRunner {
    async fn run(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        workdir: &Path,
    ) -> Result<StepOutput, RunnerError> {
        self.calls.lock().unwrap().push(RunnerCall {
            job: env.get("CI_JOB_NAME").cloned().unwrap_or_default(),
            command: command.to_string(),
        });

        let hook = self.hooks.lock().unwrap().get(command).cloned();
        if let Some(hook) = hook {
            hook();
        }

        let delay = self.delays.lock().unwrap().get(command).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let files = self.files.lock().unwrap().get(command).cloned().unwrap_or_default();
        for file in files {
            let path = workdir.join(file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, command).unwrap();
        }

        let next = {
            let mut results = self.results.lock().unwrap();
            match results.get_mut(command) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Ok(0)),
                Some(queue) => queue.front().cloned().unwrap_or(Ok(0)),
                None => Ok(0),
            }
        };

        next.map(|exit_code| StepOutput {
            exit_code,
            output: format!("{}\n", command),
        })
    }
}

/// Image builder that records what it was asked to do
#[derive(Default)]
pub struct MockBuilder {
    pub operations: Mutex<Vec<String>>,
    pub specs: Mutex<Vec<PublishSpec>>,
    fail_build: bool,
    fail_push_of: Option<String>,
}

impl MockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_build() -> Self {
        Self {
            fail_build: true,
            ..Self::default()
        }
    }

    /// Pushes of references ending in `:<tag>` fail
    pub fn failing_push(tag: &str) -> Self {
        Self {
            fail_push_of: Some(format!(":{}", tag)),
            ..Self::default()
        }
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.operations()
            .into_iter()
            .filter_map(|op| op.strip_prefix("push ").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl ImageBuilder for MockBuilder {
    async fn build(&self, spec: &PublishSpec) -> Result<String, BuilderError> {
        self.operations.lock().unwrap().push(format!("build {}", spec.image_name));
        self.specs.lock().unwrap().push(spec.clone());
        if self.fail_build {
            return Err(BuilderError::Failed {
                command: "bud".to_string(),
                code: 1,
                stderr: "build failed".to_string(),
            });
        }
        Ok("sha256:feedface".to_string())
    }

    async fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), BuilderError> {
        self.operations
            .lock()
            .unwrap()
            .push(format!("login {} {}", registry, credentials.username));
        Ok(())
    }

    async fn push(&self, reference: &str) -> Result<(), BuilderError> {
        self.operations.lock().unwrap().push(format!("push {}", reference));
        match &self.fail_push_of {
            Some(suffix) if reference.ends_with(suffix.as_str()) => Err(BuilderError::Failed {
                command: "push".to_string(),
                code: 125,
                stderr: "denied".to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn logout(&self) -> Result<(), BuilderError> {
        self.operations.lock().unwrap().push("logout".to_string());
        Ok(())
    }
}

/// Description publisher that records repositories it updated
#[derive(Default)]
pub struct MockDescriber {
    pub updates: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl DescriptionPublisher for MockDescriber {
    async fn publish(
        &self,
        repository: &str,
        full_description: &str,
        _short_description: Option<&str>,
        _credentials: &Credentials,
    ) -> Result<(), DescriptionError> {
        self.updates
            .lock()
            .unwrap()
            .push((repository.to_string(), full_description.to_string()));
        Ok(())
    }
}

/// Parse a pipeline from YAML string
pub fn pipeline_from_yaml(yaml: &str) -> Pipeline {
    PipelineConfig::from_yaml(yaml)
        .unwrap_or_else(|e| panic!("Failed to parse pipeline YAML: {}", e))
        .to_pipeline()
        .unwrap_or_else(|e| panic!("Invalid pipeline: {}", e))
}

/// The reference pipeline shipped with the crate
pub fn bridges_pipeline() -> Pipeline {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("pipelines/bridges.yml");
    PipelineConfig::from_file(&path)
        .unwrap_or_else(|e| panic!("Failed to load {}: {}", path.display(), e))
        .to_pipeline()
        .unwrap_or_else(|e| panic!("Invalid reference pipeline: {}", e))
}

pub fn trigger(source: &str, ref_name: &str) -> TriggerContext {
    trigger_with(RawTrigger {
        source: source.to_string(),
        ref_name: ref_name.to_string(),
        commit_short_sha: Some("1a2b3c4d".to_string()),
        ..Default::default()
    })
}

pub fn trigger_with(raw: RawTrigger) -> TriggerContext {
    TriggerContext::resolve(raw).unwrap_or_else(|e| panic!("Invalid trigger: {}", e))
}

/// Everything needed to run a pipeline against mocks
pub struct Harness {
    pub runner: Arc<MockRunner>,
    pub artifacts: Arc<ArtifactStore>,
    pub builder: Arc<MockBuilder>,
    pub describer: Arc<MockDescriber>,
    pub credentials: Option<Credentials>,
    pub workspace: PathBuf,
    pub strategy: SchedulingStrategy,
}

impl Harness {
    pub fn new(runner: MockRunner) -> Self {
        Self {
            runner: Arc::new(runner),
            artifacts: Arc::new(ArtifactStore::in_memory()),
            builder: Arc::new(MockBuilder::new()),
            describer: Arc::new(MockDescriber::default()),
            credentials: Credentials::new("bridges-ci", "s3cr3t-token"),
            workspace: std::env::temp_dir(),
            strategy: SchedulingStrategy::Parallel,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Arc::new(artifacts);
        self
    }

    pub fn with_builder(mut self, builder: MockBuilder) -> Self {
        self.builder = Arc::new(builder);
        self
    }

    pub fn with_workspace(mut self, workspace: &Path) -> Self {
        self.workspace = workspace.to_path_buf();
        self
    }

    pub fn without_credentials(mut self) -> Self {
        self.credentials = None;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.strategy = SchedulingStrategy::Sequential;
        self
    }

    pub fn engine(&self, publish: Option<&PublishConfig>) -> ExecutionEngine<SharedRunner> {
        let mut executor = JobExecutor::new(SharedRunner(Arc::clone(&self.runner)), Arc::clone(&self.artifacts))
            .with_workspace(&self.workspace);
        if let Some(config) = publish {
            let workflow = PublishWorkflow::new(
                config.clone(),
                self.credentials.clone(),
                Arc::clone(&self.builder) as Arc<dyn ImageBuilder>,
                Arc::clone(&self.describer) as Arc<dyn DescriptionPublisher>,
            );
            executor = executor.with_publisher(Arc::new(workflow));
        }
        ExecutionEngine::new(executor, self.strategy)
    }

    /// Build the graph for `trigger` and run it to completion
    pub async fn run(&self, pipeline: &Pipeline, trigger: &TriggerContext) -> PipelineTestResult {
        self.run_with(pipeline, trigger, &CancelFlag::new()).await
    }

    pub async fn run_with(
        &self,
        pipeline: &Pipeline,
        trigger: &TriggerContext,
        cancel: &CancelFlag,
    ) -> PipelineTestResult {
        let mut graph = JobGraph::build(pipeline, trigger).unwrap_or_else(|e| panic!("Graph failed: {}", e));
        let engine = self.engine(pipeline.publish.as_ref());
        let events = record_events(&engine).await;
        let report = engine.execute(&mut graph, cancel).await;
        let events = events.lock().unwrap().clone();
        PipelineTestResult {
            graph,
            report,
            events,
        }
    }

    /// Run as the newest pipeline of its ref
    pub async fn run_registered(
        &self,
        pipeline: &Pipeline,
        trigger: &TriggerContext,
        registry: &PipelineRegistry,
    ) -> PipelineTestResult {
        let mut graph = JobGraph::build(pipeline, trigger).unwrap_or_else(|e| panic!("Graph failed: {}", e));
        let engine = self.engine(pipeline.publish.as_ref());
        let events = record_events(&engine).await;
        let report = engine.run(&mut graph, registry).await;
        let events = events.lock().unwrap().clone();
        PipelineTestResult {
            graph,
            report,
            events,
        }
    }
}

/// Lets tests keep a handle on the runner the engine owns
pub struct SharedRunner(pub Arc<MockRunner>);

#[async_trait]
impl ScriptRunner for SharedRunner {
    async fn run(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        workdir: &Path,
    ) -> Result<StepOutput, RunnerError> {
        self.0.run(command, env, workdir).await
    }
}

async fn record_events(engine: &ExecutionEngine<SharedRunner>) -> Arc<Mutex<Vec<ExecutionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine
        .add_event_handler(move |event| sink.lock().unwrap().push(event))
        .await;
    events
}

/// Test result from running a pipeline
pub struct PipelineTestResult {
    pub graph: JobGraph,
    pub report: RunReport,
    pub events: Vec<ExecutionEvent>,
}

impl PipelineTestResult {
    pub fn status(&self) -> ExecutionStatus {
        self.report.status
    }

    pub fn state(&self, job: &str) -> &JobState {
        &self
            .graph
            .node(job)
            .unwrap_or_else(|| panic!("Job '{}' is not part of this run", job))
            .state
    }

    pub fn attempts(&self, job: &str) -> u32 {
        self.state(job).attempts()
    }

    /// Execution id the run's artifact bundles are stored under
    pub fn run_id(&self) -> Uuid {
        self.graph.state.execution_id
    }

    pub fn summary(&self) -> String {
        let states: Vec<String> = self
            .graph
            .nodes()
            .map(|n| format!("{}={}", n.job.name, n.state.label()))
            .collect();
        format!("{} [{}]", self.report.status, states.join(", "))
    }
}

/// Assert pipeline ended with `status`
pub fn assert_pipeline_status(result: &PipelineTestResult, status: ExecutionStatus) {
    assert_eq!(result.status(), status, "Unexpected pipeline result: {}", result.summary());
}

pub fn assert_job_succeeded(result: &PipelineTestResult, job: &str) {
    assert!(
        matches!(result.state(job), JobState::Succeeded { .. }),
        "Job '{}' should have succeeded: {}",
        job,
        result.summary()
    );
}

/// Assert a job failed with an error containing `expected_error`
pub fn assert_job_failed(result: &PipelineTestResult, job: &str, expected_error: &str) {
    match result.state(job) {
        JobState::Failed { error, .. } => assert!(
            error.contains(expected_error),
            "Job '{}' error:\n{}\n\ndoes not contain:\n{}",
            job,
            error,
            expected_error
        ),
        other => panic!("Job '{}' should have failed, but was in state: {:?}", job, other),
    }
}

pub fn assert_job_skipped(result: &PipelineTestResult, job: &str) {
    assert!(
        matches!(result.state(job), JobState::Skipped { .. }),
        "Job '{}' should have been skipped: {}",
        job,
        result.summary()
    );
}

pub fn assert_job_cancelled(result: &PipelineTestResult, job: &str) {
    assert!(
        matches!(result.state(job), JobState::Cancelled { .. }),
        "Job '{}' should have been cancelled: {}",
        job,
        result.summary()
    );
}
