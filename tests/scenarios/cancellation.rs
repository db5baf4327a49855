//! Test: cancelling and superseding runs

use crate::helpers::*;
use railyard::core::ExecutionStatus;
use railyard::execution::{CancelFlag, ExecutionEvent, PipelineRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

const PIPELINE: &str = r#"
name: cancellable
stages: [build, test, deploy]
defaults:
  interruptible: true
jobs:
  - name: compile
    stage: build
    rules: [{}]
    script: ["compile-a", "compile-b"]
    after_script: ["compile-cleanup"]
  - name: migrate
    stage: build
    rules: [{}]
    interruptible: false
    script: ["migrate-a", "migrate-b"]
  - name: unit
    stage: test
    rules: [{}]
    script: ["unit"]
  - name: integration
    stage: test
    rules: [{}]
    script: ["integration"]
  - name: deploy
    stage: deploy
    rules: [{}]
    script: ["deploy"]
"#;

#[tokio::test]
async fn test_newer_run_on_same_ref_supersedes() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let registry = PipelineRegistry::new();
    let started = Arc::new(Notify::new());

    let signal = Arc::clone(&started);
    let runner = MockRunner::new()
        .hook("compile-a", move || signal.notify_one())
        .slow("compile-a", Duration::from_millis(100))
        .slow("migrate-a", Duration::from_millis(200));
    let harness = Harness::new(runner);

    let master = trigger("push", "master");
    let newer_run = async {
        started.notified().await;
        registry.register("master", Uuid::new_v4()).await
    };
    let (result, newer_flag) = tokio::join!(
        harness.run_registered(&pipeline, &master, &registry),
        newer_run
    );

    assert_pipeline_status(&result, ExecutionStatus::Cancelled);
    assert!(!newer_flag.is_raised());

    // Interruptible job stops at the next step boundary, after-script still runs
    assert_job_cancelled(&result, "compile");
    assert_eq!(harness.runner.count("compile-b"), 0);
    assert_eq!(harness.runner.count("compile-cleanup"), 1);

    // Non-interruptible job runs to completion
    assert_job_succeeded(&result, "migrate");
    assert_eq!(harness.runner.count("migrate-b"), 1);

    for job in ["unit", "integration", "deploy"] {
        assert_job_cancelled(&result, job);
    }
    assert_eq!(harness.runner.count("unit"), 0);

    // The newer run stays registered
    assert_eq!(registry.active().await, 1);
}

#[tokio::test]
async fn test_run_on_other_ref_is_not_superseded() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let registry = PipelineRegistry::new();
    let other = registry.register("feature/relay-metrics", Uuid::new_v4()).await;

    let harness = Harness::new(MockRunner::new());
    let result = harness
        .run_registered(&pipeline, &trigger("push", "master"), &registry)
        .await;

    assert_pipeline_status(&result, ExecutionStatus::Succeeded);
    assert!(!other.is_raised());
    assert_eq!(registry.active().await, 1);
}

#[tokio::test]
async fn test_cancel_between_jobs_settles_the_rest() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let cancel = CancelFlag::new();

    let interrupt = cancel.clone();
    let harness = Harness::new(MockRunner::new().hook("unit", move || interrupt.raise())).sequential();

    let result = harness.run_with(&pipeline, &trigger("push", "master"), &cancel).await;

    assert_pipeline_status(&result, ExecutionStatus::Cancelled);
    assert_job_succeeded(&result, "compile");
    assert_job_succeeded(&result, "migrate");

    // Single-step job was already past its last boundary
    assert_job_succeeded(&result, "unit");
    assert_job_cancelled(&result, "integration");
    assert_job_cancelled(&result, "deploy");
    assert_eq!(harness.runner.count("integration"), 0);

    let cancelled: Vec<&str> = result
        .events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::JobCancelled { job, .. } => Some(job.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled, vec!["integration", "deploy"]);
}

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let cancel = CancelFlag::new();
    cancel.raise();

    let harness = Harness::new(MockRunner::new());
    let result = harness.run_with(&pipeline, &trigger("push", "master"), &cancel).await;

    assert_pipeline_status(&result, ExecutionStatus::Cancelled);
    assert!(harness.runner.calls().is_empty());
    for job in ["compile", "migrate", "unit", "integration", "deploy"] {
        assert_job_cancelled(&result, job);
    }
}
