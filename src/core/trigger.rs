//! Trigger context - the immutable facts about why a pipeline run started

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while resolving the trigger context
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("Unrecognized pipeline source: '{0}'")]
    UnknownSource(String),

    #[error("Missing commit ref name")]
    MissingRef,
}

/// What caused this pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineSource {
    Push,
    Web,
    Schedule,
    Pipeline,
    MergeRequest,
    Tag,
}

impl PipelineSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineSource::Push => "push",
            PipelineSource::Web => "web",
            PipelineSource::Schedule => "schedule",
            PipelineSource::Pipeline => "pipeline",
            PipelineSource::MergeRequest => "merge_request_event",
            PipelineSource::Tag => "tag",
        }
    }
}

impl fmt::Display for PipelineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineSource {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(PipelineSource::Push),
            "web" => Ok(PipelineSource::Web),
            "schedule" => Ok(PipelineSource::Schedule),
            "pipeline" => Ok(PipelineSource::Pipeline),
            "merge_request_event" | "merge_request" | "merge-request" => {
                Ok(PipelineSource::MergeRequest)
            }
            "tag" => Ok(PipelineSource::Tag),
            other => Err(TriggerError::UnknownSource(other.to_string())),
        }
    }
}

/// Raw invocation metadata, before validation
#[derive(Debug, Clone, Default)]
pub struct RawTrigger {
    pub source: String,
    pub ref_name: String,
    pub commit_tag: Option<String>,
    pub commit_short_sha: Option<String>,
    pub schedule_variable: Option<(String, String)>,
    pub changed_paths: Option<Vec<String>>,
}

impl RawTrigger {
    /// Read trigger facts from the CI environment
    ///
    /// `schedule_var` names the variable that labels scheduled runs
    /// (for example `PIPELINE=nightly`).
    pub fn from_env(schedule_var: Option<&str>) -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let schedule_variable = schedule_var
            .and_then(|name| non_empty(name).map(|value| (name.to_string(), value)));

        let changed_paths = non_empty("CI_CHANGED_FILES").map(|files| {
            files
                .split(|c: char| c == '\n' || c == ',' || c.is_whitespace())
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        });

        Self {
            source: non_empty("CI_PIPELINE_SOURCE").unwrap_or_default(),
            ref_name: non_empty("CI_COMMIT_REF_NAME").unwrap_or_default(),
            commit_tag: non_empty("CI_COMMIT_TAG"),
            commit_short_sha: non_empty("CI_COMMIT_SHORT_SHA"),
            schedule_variable,
            changed_paths,
        }
    }
}

/// Resolved, immutable trigger context. Created once per pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContext {
    source: PipelineSource,
    ref_name: String,
    commit_tag: Option<String>,
    commit_short_sha: Option<String>,
    schedule_variable: Option<(String, String)>,
    changed_paths: Option<BTreeSet<String>>,
}

impl TriggerContext {
    /// Validate raw metadata into a context. Ref names are kept verbatim.
    pub fn resolve(raw: RawTrigger) -> Result<Self, TriggerError> {
        let source: PipelineSource = raw.source.trim().parse()?;

        if raw.ref_name.is_empty() {
            return Err(TriggerError::MissingRef);
        }

        Ok(Self {
            source,
            ref_name: raw.ref_name,
            commit_tag: raw.commit_tag.filter(|t| !t.is_empty()),
            commit_short_sha: raw.commit_short_sha.filter(|s| !s.is_empty()),
            schedule_variable: raw.schedule_variable,
            changed_paths: raw.changed_paths.map(|paths| paths.into_iter().collect()),
        })
    }

    pub fn source(&self) -> PipelineSource {
        self.source
    }

    pub fn ref_name(&self) -> &str {
        &self.ref_name
    }

    pub fn commit_tag(&self) -> Option<&str> {
        self.commit_tag.as_deref()
    }

    pub fn commit_short_sha(&self) -> Option<&str> {
        self.commit_short_sha.as_deref()
    }

    pub fn schedule_variable(&self) -> Option<(&str, &str)> {
        self.schedule_variable
            .as_ref()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Changed paths, when the trigger knows them
    pub fn changed_paths(&self) -> Option<&BTreeSet<String>> {
        self.changed_paths.as_ref()
    }
}
