//! Test: transient failures re-run the whole job within the retry bound

use crate::helpers::*;
use railyard::core::config::PipelineConfig;
use railyard::core::job::FailureClass;
use railyard::core::{ExecutionStatus, JobState};
use railyard::execution::{ExecutionEvent, RunnerError};

fn pipeline(allow_failure: bool) -> railyard::core::Pipeline {
    pipeline_from_yaml(&format!(
        r#"
name: retries
stages: [build, publish]
defaults:
  retry:
    max: 2
    when: [runner_system_failure, unknown_failure, api_failure]
jobs:
  - name: build
    stage: build
    rules: [{{ if: {{ ref: master }} }}]
    allow_failure: {}
    script: ["fetch", "compile"]
  - name: package
    stage: publish
    rules: [{{ if: {{ ref: master }} }}]
    script: ["package"]
"#,
        allow_failure
    ))
}

fn system_failure() -> Result<i32, RunnerError> {
    Err(RunnerError::System("runner lost connection".to_string()))
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let runner = MockRunner::new().on("compile", vec![system_failure(), Ok(0)]);
    let harness = Harness::new(runner);

    let result = harness.run(&pipeline(false), &trigger("push", "master")).await;

    assert_pipeline_status(&result, ExecutionStatus::Succeeded);
    assert_job_succeeded(&result, "build");
    assert_eq!(result.attempts("build"), 2);

    // A retry re-runs the job from its first step
    assert_eq!(harness.runner.count("fetch"), 2);
    assert_eq!(harness.runner.count("compile"), 2);

    let retries = result
        .events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::JobRetrying { job, .. } if job == "build"))
        .count();
    assert_eq!(retries, 1);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let runner = MockRunner::new().on(
        "compile",
        vec![Err(RunnerError::Unknown("timeout after 3600 seconds".to_string()))],
    );
    let harness = Harness::new(runner);

    let result = harness.run(&pipeline(false), &trigger("push", "master")).await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_job_failed(&result, "build", "timeout after 3600 seconds");
    assert_job_failed(&result, "build", "unknown_failure persisted after 3 attempt(s)");
    assert_eq!(result.attempts("build"), 3);
    assert_eq!(harness.runner.count("compile"), 3);

    // Exhausted infrastructure failures end as script failures
    assert!(matches!(
        result.state("build"),
        JobState::Failed {
            class: FailureClass::ScriptFailure,
            ..
        }
    ));
    assert_job_skipped(&result, "package");
}

#[tokio::test]
async fn test_script_failure_is_not_retried() {
    let harness = Harness::new(MockRunner::new().failing("compile"));

    let result = harness.run(&pipeline(false), &trigger("push", "master")).await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_eq!(result.attempts("build"), 1);
    assert_eq!(harness.runner.count("compile"), 1);
    assert!(matches!(
        result.state("build"),
        JobState::Failed {
            class: FailureClass::ScriptFailure,
            ..
        }
    ));
}

#[tokio::test]
async fn test_allow_failure_applies_after_retries_are_exhausted() {
    let runner = MockRunner::new().on("compile", vec![Err(RunnerError::Api("503 from coordinator".to_string()))]);
    let harness = Harness::new(runner);

    let result = harness.run(&pipeline(true), &trigger("push", "master")).await;

    assert_pipeline_status(&result, ExecutionStatus::Succeeded);
    assert_eq!(result.attempts("build"), 3);
    assert!(matches!(
        result.state("build"),
        JobState::Failed {
            allowed: true,
            class: FailureClass::ScriptFailure,
            ..
        }
    ));
    assert_job_succeeded(&result, "package");
}

#[tokio::test]
async fn test_script_failures_can_not_be_configured_for_retry() {
    let err = PipelineConfig::from_yaml(
        r#"
name: bad-retry
stages: [test]
jobs:
  - name: test
    stage: test
    rules: [{}]
    retry:
      max: 2
      when: [script_failure]
    script: ["test"]
"#,
    )
    .unwrap_err();

    assert!(err.to_string().contains("non-transient failure class 'script_failure'"));
}
