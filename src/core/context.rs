//! Job environment - the variables a job sees while it runs

use crate::core::trigger::TriggerContext;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

pub const CI_JOB_NAME: &str = "CI_JOB_NAME";
pub const CI_JOB_STAGE: &str = "CI_JOB_STAGE";
pub const CI_PIPELINE_SOURCE: &str = "CI_PIPELINE_SOURCE";
pub const CI_COMMIT_REF_NAME: &str = "CI_COMMIT_REF_NAME";
pub const CI_COMMIT_TAG: &str = "CI_COMMIT_TAG";
pub const CI_COMMIT_SHORT_SHA: &str = "CI_COMMIT_SHORT_SHA";

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("variable pattern is valid")
    })
}

/// Expand `${VAR}` and `$VAR` references. Unknown variables expand to nothing.
pub fn expand_variables(input: &str, variables: &HashMap<String, String>) -> String {
    variable_pattern()
        .replace_all(input, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map_or("", |m| m.as_str());
            variables.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Variables visible to one job
///
/// Layers, later wins: predefined trigger variables, pipeline globals,
/// job-level variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobEnvironment {
    /// Fully resolved variables
    pub variables: HashMap<String, String>,

    /// Values that must never appear in logs or reports
    #[serde(skip)]
    secrets: Vec<String>,
}

impl JobEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predefined variables derived from the trigger and job identity
    pub fn predefined(job_name: &str, stage: &str, trigger: &TriggerContext) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert(CI_JOB_NAME.to_string(), job_name.to_string());
        vars.insert(CI_JOB_STAGE.to_string(), stage.to_string());
        vars.insert(CI_PIPELINE_SOURCE.to_string(), trigger.source().to_string());
        vars.insert(CI_COMMIT_REF_NAME.to_string(), trigger.ref_name().to_string());
        if let Some(tag) = trigger.commit_tag() {
            vars.insert(CI_COMMIT_TAG.to_string(), tag.to_string());
        }
        if let Some(sha) = trigger.commit_short_sha() {
            vars.insert(CI_COMMIT_SHORT_SHA.to_string(), sha.to_string());
        }
        if let Some((key, value)) = trigger.schedule_variable() {
            vars.insert(key.to_string(), value.to_string());
        }
        vars
    }

    /// Build the environment for a job
    pub fn for_job(
        job_name: &str,
        stage: &str,
        trigger: &TriggerContext,
        globals: &HashMap<String, String>,
        job_variables: &HashMap<String, String>,
    ) -> Self {
        let mut variables = Self::predefined(job_name, stage, trigger);
        variables.extend(globals.iter().map(|(k, v)| (k.clone(), v.clone())));
        variables.extend(job_variables.iter().map(|(k, v)| (k.clone(), v.clone())));

        Self {
            variables,
            secrets: Vec::new(),
        }
    }

    /// Set a variable
    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    /// Get a variable
    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }

    /// Register a secret value for masking
    pub fn add_secret(&mut self, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.secrets.push(value);
        }
    }

    /// Expand variable references against this environment
    pub fn expand(&self, input: &str) -> String {
        expand_variables(input, &self.variables)
    }

    /// Replace every registered secret with `***`
    pub fn mask(&self, input: &str) -> String {
        self.secrets
            .iter()
            .fold(input.to_string(), |out, secret| out.replace(secret.as_str(), "***"))
    }
}
