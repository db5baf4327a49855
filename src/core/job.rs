//! Job domain model

use crate::artifact::parse_expiry;
use crate::core::{
    config::{ConfigError, JobConfig, PublishKind, RetryConfig},
    rule::RuleSet,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Why a job attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Malformed definition or missing prerequisites; never retried
    Configuration,
    /// A command exited non-zero
    ScriptFailure,
    RunnerSystemFailure,
    UnknownFailure,
    ApiFailure,
    /// Image push or registry update failed after a successful build
    PublishFailure,
    Cancelled,
}

impl FailureClass {
    /// Infrastructure failures that may be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureClass::RunnerSystemFailure | FailureClass::UnknownFailure | FailureClass::ApiFailure
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Configuration => "configuration",
            FailureClass::ScriptFailure => "script_failure",
            FailureClass::RunnerSystemFailure => "runner_system_failure",
            FailureClass::UnknownFailure => "unknown_failure",
            FailureClass::ApiFailure => "api_failure",
            FailureClass::PublishFailure => "publish_failure",
            FailureClass::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy for transient failures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_retries: u32,

    /// Failure classes that trigger a re-run
    pub retry_on: BTreeSet<FailureClass>,
}

impl RetryPolicy {
    pub fn from_config(job: &str, config: &RetryConfig) -> Result<Self, ConfigError> {
        if let Some(class) = config.when.iter().find(|c| !c.is_transient()) {
            return Err(ConfigError::NonTransientRetry {
                job: job.to_string(),
                class: *class,
            });
        }
        Ok(Self {
            max_retries: config.max,
            retry_on: config.when.iter().copied().collect(),
        })
    }

    /// Whether another attempt is allowed after `retries_used` retries
    pub fn should_retry(&self, class: FailureClass, retries_used: u32) -> bool {
        class.is_transient() && self.retry_on.contains(&class) && retries_used < self.max_retries
    }
}

/// Declared job outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    /// Bundle name template, expanded with the job environment
    pub name: String,
    pub paths: Vec<String>,
    pub expire_in: Duration,
}

pub const DEFAULT_ARTIFACT_NAME: &str = "${CI_JOB_NAME}_${CI_COMMIT_REF_NAME}";

/// What a job does when it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    /// Opaque script steps
    Script,
    /// Build and push the container image
    PublishImage,
    /// Push the registry description file
    PublishDescription,
}

/// Values a job inherits unless it sets its own
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub retry: RetryPolicy,
    pub interruptible: bool,
    pub artifact_expiry: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            interruptible: false,
            artifact_expiry: Duration::days(7),
        }
    }
}

/// Static job definition. Never mutated at run time.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: String,
    pub stage: String,
    /// Position of `stage` in the stage sequence
    pub stage_index: usize,
    pub rules: RuleSet,
    pub script: Vec<String>,
    pub after_script: Vec<String>,
    pub retry: RetryPolicy,
    pub artifacts: Option<ArtifactSpec>,
    pub needs: Vec<String>,
    pub allow_failure: bool,
    pub interruptible: bool,
    pub variables: HashMap<String, String>,
    pub action: JobAction,
}

impl JobDefinition {
    /// Create a job from its config, merging pipeline defaults
    pub fn from_config(
        config: &JobConfig,
        stage_index: usize,
        rules: RuleSet,
        defaults: &JobDefaults,
    ) -> Result<Self, ConfigError> {
        let retry = match &config.retry {
            Some(retry) => RetryPolicy::from_config(&config.name, retry)?,
            None => defaults.retry.clone(),
        };

        let artifacts = config
            .artifacts
            .as_ref()
            .map(|a| -> Result<ArtifactSpec, ConfigError> {
                let expire_in = match &a.expire_in {
                    Some(text) => parse_expiry(text)?,
                    None => defaults.artifact_expiry,
                };
                Ok(ArtifactSpec {
                    name: a.name.clone().unwrap_or_else(|| DEFAULT_ARTIFACT_NAME.to_string()),
                    paths: a.paths.clone(),
                    expire_in,
                })
            })
            .transpose()?;

        let action = match config.publish {
            None => JobAction::Script,
            Some(PublishKind::Image) => JobAction::PublishImage,
            Some(PublishKind::Description) => JobAction::PublishDescription,
        };

        Ok(JobDefinition {
            name: config.name.clone(),
            stage: config.stage.clone(),
            stage_index,
            rules,
            script: config.script.clone(),
            after_script: config.after_script.clone(),
            retry,
            artifacts,
            needs: config.needs.clone(),
            allow_failure: config.allow_failure,
            interruptible: config.interruptible.unwrap_or(defaults.interruptible),
            variables: config.variables.clone(),
            action,
        })
    }

    /// Whether this job declared explicit `needs`
    pub fn has_needs(&self) -> bool {
        !self.needs.is_empty()
    }
}
