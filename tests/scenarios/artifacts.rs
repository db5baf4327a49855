//! Test: artifact bundles flow along needs and to later stages

use crate::helpers::*;
use chrono::{Duration, Utc};
use railyard::artifact::{ArtifactBundle, ArtifactStore};
use railyard::core::ExecutionStatus;
use std::path::PathBuf;
use tempfile::TempDir;
use uuid::Uuid;

const PIPELINE: &str = r#"
name: bundles
stages: [build, test, publish]
defaults:
  artifact_expiry: 7 days
jobs:
  - name: build
    stage: build
    rules: [{}]
    script: ["make"]
    artifacts:
      paths: [artifacts/]
  - name: docs
    stage: build
    rules: [{}]
    script: ["render docs"]
    artifacts:
      paths: [book/index.html]
      expire_in: 1 day
  - name: smoke
    stage: build
    rules: [{}]
    needs: [build]
    script: ["smoke"]
  - name: audit
    stage: test
    rules: [{}]
    script: ["audit"]
    artifacts:
      name: "audit-${CI_COMMIT_REF_NAME}"
      paths: [audit.log]
  - name: image
    stage: publish
    rules: [{}]
    needs: [build]
    script: ["ship"]
  - name: report
    stage: publish
    rules: [{}]
    script: ["summarize"]
"#;

fn runner() -> MockRunner {
    MockRunner::new()
        .creates("make", "artifacts/substrate-relay")
        .creates("make", "artifacts/ci.Dockerfile")
        .creates("render docs", "book/index.html")
        .creates("audit", "audit.log")
}

fn rooted_harness(runner: MockRunner) -> (TempDir, Harness) {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();
    let harness = Harness::new(runner)
        .with_workspace(&workspace)
        .with_artifacts(ArtifactStore::new(dir.path().join("store")));
    (dir, harness)
}

#[tokio::test]
async fn test_bundles_are_named_after_job_and_ref() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let (dir, harness) = rooted_harness(runner());

    let result = harness.run(&pipeline, &trigger("push", "master")).await;
    assert_pipeline_status(&result, ExecutionStatus::Succeeded);

    let run = result.run_id();
    let build = harness.artifacts.get(run, "build").await.expect("build bundle stored");
    assert_eq!(build.name, "build_master");
    assert_eq!(build.expire_in, Duration::days(7));
    assert_eq!(build.location, Some(dir.path().join("store").join("build_master")));
    assert!(dir
        .path()
        .join("store/build_master/artifacts/substrate-relay")
        .is_file());

    let docs = harness.artifacts.get(run, "docs").await.expect("docs bundle stored");
    assert_eq!(docs.expire_in, Duration::days(1));
    assert_eq!(docs.paths, vec![PathBuf::from("book/index.html")]);

    let audit = harness.artifacts.get(run, "audit").await.expect("audit bundle stored");
    assert_eq!(audit.name, "audit-master");
}

#[tokio::test]
async fn test_needs_restrict_visible_bundles() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let (_dir, harness) = rooted_harness(runner());

    let run = harness.run(&pipeline, &trigger("push", "master")).await.run_id();

    let image = pipeline.job("image").unwrap();
    let visible: Vec<String> = harness
        .artifacts
        .visible_to(run, image, Utc::now())
        .await
        .into_iter()
        .map(|b| b.owner_job)
        .collect();
    assert_eq!(visible, vec!["build"]);

    // Same-stage consumer through needs
    let smoke = pipeline.job("smoke").unwrap();
    let visible = harness.artifacts.visible_to(run, smoke, Utc::now()).await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].name, "build_master");
}

#[tokio::test]
async fn test_later_stages_inherit_earlier_bundles() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let (_dir, harness) = rooted_harness(runner());

    let run = harness.run(&pipeline, &trigger("push", "master")).await.run_id();

    let report = pipeline.job("report").unwrap();
    let owners: Vec<String> = harness
        .artifacts
        .visible_to(run, report, Utc::now())
        .await
        .into_iter()
        .map(|b| b.owner_job)
        .collect();
    assert_eq!(owners, vec!["audit", "build", "docs"]);

    // Nothing from its own stage or later
    let audit = pipeline.job("audit").unwrap();
    let owners: Vec<String> = harness
        .artifacts
        .visible_to(run, audit, Utc::now())
        .await
        .into_iter()
        .map(|b| b.owner_job)
        .collect();
    assert_eq!(owners, vec!["build", "docs"]);
}

#[tokio::test]
async fn test_expired_bundles_are_never_served() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let (dir, harness) = rooted_harness(runner());

    let run = harness.run(&pipeline, &trigger("push", "master")).await.run_id();

    let docs = pipeline.job("docs").unwrap();
    let report = pipeline.job("report").unwrap();
    let in_two_days = Utc::now() + Duration::days(2);

    assert!(harness.artifacts.get_at(run, "docs", in_two_days).await.is_none());
    let owners: Vec<String> = harness
        .artifacts
        .visible_to(run, report, in_two_days)
        .await
        .into_iter()
        .map(|b| b.owner_job)
        .collect();
    assert!(!owners.contains(&docs.name));
    assert!(owners.contains(&"build".to_string()));

    assert_eq!(harness.artifacts.purge_expired(in_two_days).await, 1);
    assert!(!dir.path().join("store/docs_master").exists());
}

#[tokio::test]
async fn test_stale_bundle_is_purged_before_the_run() {
    let dir = TempDir::new().unwrap();
    let stale_location = dir.path().join("store/build_release");
    std::fs::create_dir_all(stale_location.join("artifacts")).unwrap();
    std::fs::write(stale_location.join("artifacts/old-binary"), "stale").unwrap();

    let store = ArtifactStore::new(dir.path().join("store"));
    let earlier_run = Uuid::new_v4();
    store
        .put(ArtifactBundle {
            run_id: earlier_run,
            owner_job: "build".to_string(),
            owner_stage: 0,
            name: "build_release".to_string(),
            paths: vec![PathBuf::from("artifacts")],
            location: Some(stale_location.clone()),
            expire_in: Duration::days(7),
            created_at: Utc::now() - Duration::days(8),
        })
        .await
        .unwrap();

    let pipeline = pipeline_from_yaml(
        r#"
name: consumer
stages: [build, publish]
jobs:
  - name: report
    stage: publish
    rules: [{}]
    script: ["summarize"]
"#,
    );
    let workspace = dir.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();
    let harness = Harness::new(MockRunner::new())
        .with_workspace(&workspace)
        .with_artifacts(store);

    let result = harness.run(&pipeline, &trigger("push", "release")).await;

    assert_pipeline_status(&result, ExecutionStatus::Succeeded);
    assert!(harness.artifacts.get_at(earlier_run, "build", Utc::now()).await.is_none());
    assert!(harness.artifacts.bundles(Utc::now()).await.is_empty());
    assert!(!workspace.join("artifacts/old-binary").exists());
    assert!(!stale_location.exists());
}

#[tokio::test]
async fn test_failed_producer_skips_its_consumers() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let (_dir, harness) = rooted_harness(runner().failing("make"));

    let result = harness.run(&pipeline, &trigger("push", "master")).await;

    assert_pipeline_status(&result, ExecutionStatus::Failed);
    assert_job_failed(&result, "build", "make");
    assert_job_skipped(&result, "smoke");
    assert_job_succeeded(&result, "docs");
    assert_eq!(harness.runner.count("smoke"), 0);

    // Only successful jobs leave a bundle behind
    let run = result.run_id();
    assert!(harness.artifacts.get(run, "build").await.is_none());
    assert!(harness.artifacts.get(run, "docs").await.is_some());
}

#[tokio::test]
async fn test_reused_store_serves_only_the_current_run() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let (dir, harness) = rooted_harness(runner());

    let feature = harness.run(&pipeline, &trigger("push", "feature/a")).await;
    assert_pipeline_status(&feature, ExecutionStatus::Succeeded);
    let master = harness.run(&pipeline, &trigger("push", "master")).await;
    assert_pipeline_status(&master, ExecutionStatus::Succeeded);

    let build = harness
        .artifacts
        .get(master.run_id(), "build")
        .await
        .expect("master build bundle stored");
    assert_eq!(build.name, "build_master");
    assert_eq!(build.run_id, master.run_id());

    let image = pipeline.job("image").unwrap();
    let visible: Vec<String> = harness
        .artifacts
        .visible_to(master.run_id(), image, Utc::now())
        .await
        .into_iter()
        .map(|b| b.name)
        .collect();
    assert_eq!(visible, vec!["build_master"]);

    // The earlier run keeps its own bundle under its own name
    let earlier = harness.artifacts.get(feature.run_id(), "build").await.unwrap();
    assert_eq!(earlier.name, "build_feature/a");
    assert!(dir.path().join("store/build_master/artifacts/substrate-relay").is_file());
}

#[tokio::test]
async fn test_rerun_on_same_ref_replaces_the_bundle() {
    let pipeline = pipeline_from_yaml(PIPELINE);
    let (dir, harness) = rooted_harness(runner());

    let first = harness.run(&pipeline, &trigger("push", "master")).await;
    std::fs::write(dir.path().join("store/build_master/artifacts/leftover"), "old").unwrap();
    let second = harness.run(&pipeline, &trigger("push", "master")).await;
    assert_pipeline_status(&second, ExecutionStatus::Succeeded);

    assert!(harness.artifacts.get(first.run_id(), "build").await.is_none());
    let build = harness.artifacts.get(second.run_id(), "build").await.unwrap();
    assert_eq!(build.run_id, second.run_id());
    assert!(!dir.path().join("store/build_master/artifacts/leftover").exists());
    assert!(dir.path().join("store/build_master/artifacts/substrate-relay").is_file());
}
