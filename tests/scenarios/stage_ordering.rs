//! Test: stages run strictly in order and a failed stage stops the run

use crate::helpers::*;
use railyard::core::{ExecutionStatus, JobState, StageStatus};

const PIPELINE: &str = r#"
name: ordering
stages: [lint, check, test, build]
rule_sets:
  always:
    - if: { source: push }
    - if: { source: web }
jobs:
  - name: fmt
    stage: lint
    rules: always
    script: ["fmt"]
  - name: spellcheck
    stage: lint
    rules: always
    allow_failure: true
    script: ["spellcheck"]
  - name: check
    stage: check
    rules: always
    script: ["clippy", "check"]
  - name: test
    stage: test
    rules: always
    script: ["test"]
  - name: build
    stage: build
    rules: always
    script: ["build"]
  - name: nightly
    stage: build
    rules:
      - if: { source: schedule }
    script: ["build-nightly"]
"#;

#[tokio::test]
async fn test_stages_run_in_declared_order() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let harness = Harness::new(MockRunner::new()).sequential();

    let result = harness.run(&pipeline, &trigger("push", "master")).await;

    assert_pipeline_status(&result, ExecutionStatus::Succeeded);
    assert_eq!(
        harness.runner.job_order(),
        vec!["fmt", "spellcheck", "check", "test", "build"]
    );
    assert_eq!(harness.runner.commands()[2..4], ["clippy", "check"]);
}

#[tokio::test]
async fn test_parallel_jobs_never_cross_stage_boundaries() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let harness = Harness::new(
        MockRunner::new()
            .slow("fmt", std::time::Duration::from_millis(50))
            .slow("spellcheck", std::time::Duration::from_millis(10)),
    );

    let result = harness.run(&pipeline, &trigger("push", "master")).await;

    assert_pipeline_status(&result, ExecutionStatus::Succeeded);
    let order = harness.runner.job_order();
    let position = |job: &str| order.iter().position(|j| j == job).unwrap();
    assert!(position("check") > position("fmt"));
    assert!(position("check") > position("spellcheck"));
    assert!(position("test") > position("check"));
    assert!(position("build") > position("test"));
}

#[tokio::test]
async fn test_failed_stage_stops_later_stages() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let harness = Harness::new(MockRunner::new().failing("clippy"));

    let result = harness.run(&pipeline, &trigger("push", "master")).await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_job_failed(&result, "check", "step 1 `clippy` exited with code 1");
    assert_job_skipped(&result, "test");
    assert_job_skipped(&result, "build");

    // The first failing step ends the job
    assert_eq!(harness.runner.count("check"), 0);
    assert_eq!(harness.runner.count("test"), 0);
    assert_eq!(result.graph.stages[1].status, StageStatus::Failed);
    assert_eq!(result.graph.stages[2].status, StageStatus::Skipped);
}

#[tokio::test]
async fn test_allowed_failure_does_not_block() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let harness = Harness::new(MockRunner::new().failing("spellcheck"));

    let result = harness.run(&pipeline, &trigger("push", "master")).await;

    assert_pipeline_status(&result, ExecutionStatus::Succeeded);
    assert!(matches!(
        result.state("spellcheck"),
        JobState::Failed { allowed: true, .. }
    ));
    assert_eq!(result.graph.stages[0].status, StageStatus::PartiallyFailedAllowed);
    assert_job_succeeded(&result, "build");

    assert_eq!(result.report.warnings.len(), 1);
    assert!(result.report.warnings[0].starts_with("spellcheck failed"));
}

#[tokio::test]
async fn test_excluded_jobs_are_not_part_of_the_run() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let harness = Harness::new(MockRunner::new());

    let result = harness.run(&pipeline, &trigger("web", "feature/login")).await;

    assert_pipeline_status(&result, ExecutionStatus::Succeeded);
    assert!(result.graph.node("nightly").is_none());
    assert_eq!(result.report.excluded, vec!["nightly".to_string()]);
    assert_eq!(harness.runner.count("build-nightly"), 0);
}

#[tokio::test]
async fn test_after_script_runs_when_script_fails() {
    let pipeline = pipeline_from_yaml(
        r#"
name: cleanup
stages: [test]
jobs:
  - name: deny
    stage: test
    rules: [{}]
    allow_failure: true
    script: ["deny advisories", "deny bans"]
    after_script: ["collect logs"]
"#,
    );
    let harness = Harness::new(MockRunner::new().failing("deny advisories").failing("collect logs"));

    let result = harness.run(&pipeline, &trigger("schedule", "master")).await;

    assert_pipeline_status(&result, ExecutionStatus::Succeeded);
    assert_eq!(harness.runner.commands(), vec!["deny advisories", "collect logs"]);
    assert_job_failed(&result, "deny", "deny advisories");
    let log = &result.graph.node("deny").unwrap().log;
    assert!(log.contains("$ collect logs"));
}
