//! Pipeline configuration from YAML

use crate::core::{job::FailureClass, rule::When, Pipeline};
use crate::publish::PublishConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Configuration errors - always detected before any job runs
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Pipeline defines no stages")]
    NoStages,

    #[error("Duplicate stage: {0}")]
    DuplicateStage(String),

    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Job '{job}' uses unknown stage '{stage}'")]
    UnknownStage { job: String, stage: String },

    #[error("Job '{job}' references unknown rule set '{name}'")]
    UnknownRuleSet { job: String, name: String },

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Job '{job}' needs non-existent job '{need}'")]
    UnknownNeed { job: String, need: String },

    #[error("Job '{job}' needs '{need}', which runs in a later stage")]
    NeedInLaterStage { job: String, need: String },

    #[error("Cycle detected in needs graph involving job '{0}'")]
    NeedsCycle(String),

    #[error("Job '{job}' retries on non-transient failure class '{class}'")]
    NonTransientRetry { job: String, class: FailureClass },

    #[error("Invalid expiry '{0}'")]
    InvalidExpiry(String),

    #[error("Job '{0}' has no script")]
    EmptyScript(String),

    #[error("Job '{0}' publishes but the pipeline has no publish settings")]
    MissingPublishSettings(String),
}

/// Default stage sequence
pub fn default_stages() -> Vec<String> {
    ["lint", "check", "test", "build", "publish", "publish-docker-description"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_true() -> bool {
    true
}

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Ordered stage names
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,

    /// Variable that labels scheduled runs (e.g. `PIPELINE`)
    #[serde(default)]
    pub schedule_variable: Option<String>,

    /// Global variables available to all jobs
    #[serde(default)]
    pub variables: HashMap<String, String>,

    /// Values jobs inherit unless overridden
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Named rule lists shared between jobs
    #[serde(default)]
    pub rule_sets: BTreeMap<String, Vec<RuleConfig>>,

    /// Image and description publishing settings
    #[serde(default)]
    pub publish: Option<PublishConfig>,

    /// Job definitions
    pub jobs: Vec<JobConfig>,
}

/// Global defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub interruptible: Option<bool>,

    /// Default artifact retention, e.g. "7 days"
    #[serde(default)]
    pub artifact_expiry: Option<String>,
}

/// Retry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first one
    #[serde(default)]
    pub max: u32,

    /// Failure classes that trigger a retry
    #[serde(default)]
    pub when: Vec<FailureClass>,
}

/// Condition clause of a rule; every present key must hold
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClauseConfig {
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default, rename = "ref")]
    pub ref_name: Option<String>,

    #[serde(default)]
    pub ref_matches: Option<String>,

    #[serde(default)]
    pub variable: BTreeMap<String, String>,
}

/// A rule as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default, rename = "if")]
    pub clause: Option<ClauseConfig>,

    #[serde(default)]
    pub changes: Option<Vec<String>>,

    #[serde(default)]
    pub when: When,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Rules of a job: a rule set name or an inline list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RulesConfig {
    Named(String),
    Inline(Vec<RuleConfig>),
}

/// Artifact declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub paths: Vec<String>,

    #[serde(default)]
    pub expire_in: Option<String>,

    /// Bundle name template
    #[serde(default)]
    pub name: Option<String>,
}

/// Which publish workflow a job runs instead of a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishKind {
    Image,
    Description,
}

/// Job configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,

    pub stage: String,

    /// Missing rules mean the job never runs
    #[serde(default)]
    pub rules: Option<RulesConfig>,

    #[serde(default)]
    pub script: Vec<String>,

    #[serde(default)]
    pub after_script: Vec<String>,

    #[serde(default)]
    pub needs: Vec<String>,

    #[serde(default)]
    pub allow_failure: bool,

    #[serde(default)]
    pub interruptible: Option<bool>,

    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub artifacts: Option<ArtifactConfig>,

    #[serde(default)]
    pub variables: HashMap<String, String>,

    #[serde(default)]
    pub publish: Option<PublishKind>,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        let mut seen_stages = HashSet::new();
        for stage in &self.stages {
            if !seen_stages.insert(stage) {
                return Err(ConfigError::DuplicateStage(stage.clone()));
            }
        }

        let mut seen_jobs = HashSet::new();
        for job in &self.jobs {
            if !seen_jobs.insert(&job.name) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
        }

        for job in &self.jobs {
            let stage_index = self.stage_index(&job.name, &job.stage)?;

            if job.publish.is_none() && job.script.is_empty() {
                return Err(ConfigError::EmptyScript(job.name.clone()));
            }
            if job.publish.is_some() && self.publish.is_none() {
                return Err(ConfigError::MissingPublishSettings(job.name.clone()));
            }

            if let Some(RulesConfig::Named(name)) = &job.rules {
                if !self.rule_sets.contains_key(name) {
                    return Err(ConfigError::UnknownRuleSet {
                        job: job.name.clone(),
                        name: name.clone(),
                    });
                }
            }

            for need in &job.needs {
                let Some(producer) = self.jobs.iter().find(|j| &j.name == need) else {
                    return Err(ConfigError::UnknownNeed {
                        job: job.name.clone(),
                        need: need.clone(),
                    });
                };
                if self.stage_index(&producer.name, &producer.stage)? > stage_index {
                    return Err(ConfigError::NeedInLaterStage {
                        job: job.name.clone(),
                        need: need.clone(),
                    });
                }
            }
        }

        self.check_cycles()?;

        // Rule compilation, retry classes and expiry strings
        self.build_pipeline().map(|_| ())
    }

    fn stage_index(&self, job: &str, stage: &str) -> Result<usize, ConfigError> {
        self.stages
            .iter()
            .position(|s| s == stage)
            .ok_or_else(|| ConfigError::UnknownStage {
                job: job.to_string(),
                stage: stage.to_string(),
            })
    }

    /// Check for cycles in the `needs` graph
    fn check_cycles(&self) -> Result<(), ConfigError> {
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for job in &self.jobs {
            if !visited.contains(&job.name) {
                self.dfs_check(&job.name, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check(
        &self,
        job_name: &str,
        visited: &mut HashSet<String>,
        recursion_stack: &mut HashSet<String>,
    ) -> Result<(), ConfigError> {
        visited.insert(job_name.to_string());
        recursion_stack.insert(job_name.to_string());

        if let Some(job) = self.jobs.iter().find(|j| j.name == job_name) {
            for need in &job.needs {
                if recursion_stack.contains(need) {
                    return Err(ConfigError::NeedsCycle(need.clone()));
                }
                if !visited.contains(need) {
                    self.dfs_check(need, visited, recursion_stack)?;
                }
            }
        }

        recursion_stack.remove(job_name);
        Ok(())
    }

    fn build_pipeline(&self) -> Result<Pipeline, ConfigError> {
        Pipeline::from_config(self)
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Result<Pipeline, ConfigError> {
        self.build_pipeline()
    }
}
