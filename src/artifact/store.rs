//! Artifact store - the only state shared between concurrently running jobs

use crate::artifact::{ArtifactBundle, ArtifactError};
use crate::core::job::{ArtifactSpec, JobDefinition};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

type BundleKey = (Uuid, String);

/// Store of artifact bundles, keyed by run and producing job
///
/// With a root directory, captured files are copied under
/// `<root>/<bundle name>/`; without one only the index is kept. Readers
/// only ever see bundles of their own run.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    root: Option<PathBuf>,
    bundles: RwLock<HashMap<BundleKey, ArtifactBundle>>,
}

impl ArtifactStore {
    /// Store that copies captured files under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            bundles: RwLock::new(HashMap::new()),
        }
    }

    /// Index-only store
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Publish a bundle; visible to readers of its run once this returns
    ///
    /// A bundle of the same name left by an earlier run is replaced: its
    /// directory already holds the newer capture.
    pub async fn put(&self, bundle: ArtifactBundle) -> Result<(), ArtifactError> {
        let mut bundles = self.bundles.write().await;
        let key = (bundle.run_id, bundle.owner_job.clone());
        if bundles.contains_key(&key) {
            return Err(ArtifactError::AlreadyStored(bundle.owner_job));
        }

        let replaced: Vec<BundleKey> = bundles
            .iter()
            .filter(|(k, b)| k.0 != bundle.run_id && b.name == bundle.name)
            .map(|(k, _)| k.clone())
            .collect();
        for old in &replaced {
            if let Some(old) = bundles.remove(old) {
                debug!("Bundle {} of run {} replaced by run {}", old.name, old.run_id, bundle.run_id);
            }
        }

        info!(
            "Stored artifact bundle {} ({} path(s), expires {})",
            bundle.name,
            bundle.paths.len(),
            bundle.expires_at()
        );
        bundles.insert(key, bundle);
        Ok(())
    }

    /// Bundle produced by `job` in `run`, unless missing or expired
    pub async fn get(&self, run: Uuid, job: &str) -> Option<ArtifactBundle> {
        self.get_at(run, job, Utc::now()).await
    }

    pub async fn get_at(&self, run: Uuid, job: &str, now: DateTime<Utc>) -> Option<ArtifactBundle> {
        let bundles = self.bundles.read().await;
        bundles
            .get(&(run, job.to_string()))
            .filter(|b| !b.is_expired_at(now))
            .cloned()
    }

    /// Bundles a job of `run` may consume
    ///
    /// Jobs with `needs` see only their producers' bundles; other jobs see
    /// every bundle from strictly earlier stages.
    pub async fn visible_to(&self, run: Uuid, job: &JobDefinition, now: DateTime<Utc>) -> Vec<ArtifactBundle> {
        let bundles = self.bundles.read().await;

        let mut visible: Vec<ArtifactBundle> = if job.has_needs() {
            job.needs
                .iter()
                .filter_map(|need| bundles.get(&(run, need.clone())))
                .filter(|b| !b.is_expired_at(now))
                .cloned()
                .collect()
        } else {
            bundles
                .values()
                .filter(|b| b.run_id == run)
                .filter(|b| b.owner_stage < job.stage_index && !b.is_expired_at(now))
                .cloned()
                .collect()
        };

        visible.sort_by(|a, b| a.owner_job.cmp(&b.owner_job));
        visible
    }

    /// Copy declared paths out of `workspace` into a new bundle
    ///
    /// Declared paths that do not exist are skipped with a warning. The
    /// bundle is returned, not stored; call [`ArtifactStore::put`] once the
    /// job is known to have succeeded.
    pub async fn capture(
        &self,
        run: Uuid,
        job: &JobDefinition,
        name: &str,
        spec: &ArtifactSpec,
        workspace: &Path,
    ) -> Result<ArtifactBundle, ArtifactError> {
        let mut sources = Vec::new();
        for declared in &spec.paths {
            let matches = resolve_declared(workspace, declared)?;
            if matches.is_empty() {
                warn!("Job {}: artifact path '{}' does not exist, skipping", job.name, declared);
            }
            sources.extend(matches);
        }

        let location = self.root.as_ref().map(|root| root.join(name));
        if let Some(target) = &location {
            let target = target.clone();
            let workspace = workspace.to_path_buf();
            let relative = sources.clone();
            tokio::task::spawn_blocking(move || {
                if target.exists() {
                    std::fs::remove_dir_all(&target).map_err(io(&target))?;
                }
                for path in &relative {
                    copy_tree(&workspace.join(path), &target.join(path))?;
                }
                Ok::<_, ArtifactError>(())
            })
            .await
            .map_err(|e| ArtifactError::Task(e.to_string()))??;
        }

        debug!("Captured {} path(s) for {}", sources.len(), name);

        Ok(ArtifactBundle {
            run_id: run,
            owner_job: job.name.clone(),
            owner_stage: job.stage_index,
            name: name.to_string(),
            paths: sources,
            location,
            expire_in: spec.expire_in,
            created_at: Utc::now(),
        })
    }

    /// Copy bundle contents into a job workspace
    pub async fn restore(&self, bundles: &[ArtifactBundle], workspace: &Path) -> Result<(), ArtifactError> {
        let copies: Vec<(PathBuf, PathBuf)> = bundles
            .iter()
            .filter_map(|b| b.location.as_ref().map(|loc| (b, loc)))
            .flat_map(|(b, loc)| b.paths.iter().map(move |p| (loc.join(p), workspace.join(p))))
            .collect();

        if copies.is_empty() {
            return Ok(());
        }

        tokio::task::spawn_blocking(move || {
            for (from, to) in &copies {
                if from != to {
                    copy_tree(from, to)?;
                }
            }
            Ok::<_, ArtifactError>(())
        })
        .await
        .map_err(|e| ArtifactError::Task(e.to_string()))?
    }

    /// Drop a job's bundle, e.g. after cancellation
    pub async fn discard(&self, run: Uuid, job: &str) {
        let removed = self.bundles.write().await.remove(&(run, job.to_string()));
        if let Some(bundle) = removed {
            info!("Discarded artifact bundle {}", bundle.name);
            remove_location(&bundle).await;
        }
    }

    /// Physically delete expired bundles; returns how many were removed
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<ArtifactBundle> = {
            let mut bundles = self.bundles.write().await;
            let keys: Vec<BundleKey> = bundles
                .iter()
                .filter(|(_, b)| b.is_expired_at(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| bundles.remove(k)).collect()
        };

        for bundle in &expired {
            remove_location(bundle).await;
        }
        expired.len()
    }

    /// All live bundles
    pub async fn bundles(&self, now: DateTime<Utc>) -> Vec<ArtifactBundle> {
        let bundles = self.bundles.read().await;
        let mut live: Vec<_> = bundles.values().filter(|b| !b.is_expired_at(now)).cloned().collect();
        live.sort_by(|a, b| a.owner_job.cmp(&b.owner_job));
        live
    }
}

async fn remove_location(bundle: &ArtifactBundle) {
    if let Some(location) = &bundle.location {
        if let Err(e) = tokio::fs::remove_dir_all(location).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", location.display(), e);
            }
        }
    }
}

fn contains_glob_chars(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

/// Existing paths under `workspace` matching a declared path, relative to it
fn resolve_declared(workspace: &Path, declared: &str) -> Result<Vec<PathBuf>, ArtifactError> {
    let trimmed = declared.trim_end_matches('/');

    if !contains_glob_chars(trimmed) {
        let path = PathBuf::from(trimmed);
        return Ok(if workspace.join(&path).exists() { vec![path] } else { vec![] });
    }

    let pattern = workspace.join(trimmed);
    let entries = glob::glob(&pattern.to_string_lossy())
        .map_err(|_| ArtifactError::InvalidPattern(declared.to_string()))?;

    Ok(entries
        .filter_map(|entry| entry.ok())
        .filter_map(|p| p.strip_prefix(workspace).ok().map(Path::to_path_buf))
        .collect())
}

fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError {
    let path = path.to_path_buf();
    move |source| ArtifactError::Io { path, source }
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), ArtifactError> {
    if from.is_dir() {
        std::fs::create_dir_all(to).map_err(io(to))?;
        for entry in std::fs::read_dir(from).map_err(io(from))? {
            let entry = entry.map_err(io(from))?;
            copy_tree(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(io(parent))?;
        }
        std::fs::copy(from, to).map_err(io(from))?;
    }
    Ok(())
}
