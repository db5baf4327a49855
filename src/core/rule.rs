//! Rule engine - decides whether a job takes part in a run

use crate::core::{
    config::{ConfigError, RuleConfig},
    context::expand_variables,
    trigger::{PipelineSource, TriggerContext},
};
use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Outcome modifier attached to a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    #[default]
    OnSuccess,
    Always,
    Manual,
    Delayed,
    Never,
}

/// A single predicate over the trigger context
#[derive(Debug, Clone)]
pub enum Condition {
    /// Pipeline source equals
    Source(PipelineSource),
    /// Ref name equals exactly
    RefEquals(String),
    /// Ref name matches a regular expression
    RefMatches(Regex),
    /// Schedule label variable equals
    Variable { name: String, value: String },
}

impl Condition {
    pub fn holds(&self, context: &TriggerContext) -> bool {
        match self {
            Condition::Source(source) => context.source() == *source,
            Condition::RefEquals(name) => context.ref_name() == name.as_str(),
            Condition::RefMatches(regex) => regex.is_match(context.ref_name()),
            Condition::Variable { name, value } => context
                .schedule_variable()
                .is_some_and(|(k, v)| k == name.as_str() && v == value.as_str()),
        }
    }
}

/// One entry of a rule list
#[derive(Debug, Clone)]
pub struct Rule {
    /// Conditions joined with logical AND
    pub conditions: Vec<Condition>,

    /// Optional changed-path globs (`${VAR}` expanded per job)
    pub changes: Option<Vec<String>>,

    /// Outcome when the rule matches
    pub when: When,

    /// Disabled rules are ignored as if absent
    pub enabled: bool,
}

/// Named, immutable rule list shared by every job that references it
pub type RuleSet = Arc<[Rule]>;

/// Verdict of the rule engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Job takes part; `runs_now` is false for manual jobs
    Include { runs_now: bool },
    Exclude,
}

impl Verdict {
    pub fn is_included(&self) -> bool {
        matches!(self, Verdict::Include { .. })
    }
}

/// Evaluate a rule list against a trigger context
///
/// First fully matching rule wins; no match means the job is excluded.
/// `variables` is used only to expand `changes` globs.
pub fn evaluate(rules: &[Rule], context: &TriggerContext, variables: &HashMap<String, String>) -> Verdict {
    rules
        .iter()
        .filter(|rule| rule.enabled)
        .find(|rule| rule.matches(context, variables))
        .map(|rule| match rule.when {
            When::Never => Verdict::Exclude,
            When::Manual => Verdict::Include { runs_now: false },
            When::OnSuccess | When::Always | When::Delayed => Verdict::Include { runs_now: true },
        })
        .unwrap_or(Verdict::Exclude)
}

const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

impl Rule {
    /// Build a rule from its YAML form
    pub fn from_config(config: &RuleConfig) -> Result<Self, ConfigError> {
        let mut conditions = Vec::new();

        if let Some(clause) = &config.clause {
            if let Some(source) = &clause.source {
                let source = source
                    .parse::<PipelineSource>()
                    .map_err(|_| ConfigError::InvalidRule(format!("unknown source '{}'", source)))?;
                conditions.push(Condition::Source(source));
            }
            if let Some(name) = &clause.ref_name {
                conditions.push(Condition::RefEquals(name.clone()));
            }
            if let Some(pattern) = &clause.ref_matches {
                let regex = Regex::new(pattern).map_err(|e| {
                    ConfigError::InvalidRule(format!("bad ref pattern '{}': {}", pattern, e))
                })?;
                conditions.push(Condition::RefMatches(regex));
            }
            let mut variables: Vec<_> = clause.variable.iter().collect();
            variables.sort();
            for (name, value) in variables {
                conditions.push(Condition::Variable {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
        }

        if let Some(globs) = &config.changes {
            for glob in globs {
                Pattern::new(glob).map_err(|e| {
                    ConfigError::InvalidRule(format!("bad changes glob '{}': {}", glob, e))
                })?;
            }
        }

        Ok(Rule {
            conditions,
            changes: config.changes.clone(),
            when: config.when,
            enabled: config.enabled,
        })
    }

    /// Whether every condition and the path filter hold
    pub fn matches(&self, context: &TriggerContext, variables: &HashMap<String, String>) -> bool {
        self.conditions.iter().all(|c| c.holds(context)) && self.changes_match(context, variables)
    }

    fn changes_match(&self, context: &TriggerContext, variables: &HashMap<String, String>) -> bool {
        let Some(globs) = &self.changes else {
            return true;
        };
        // No known change set means no path can match
        let Some(changed) = context.changed_paths() else {
            return false;
        };

        let mut patterns = Vec::with_capacity(globs.len());
        for glob in globs {
            let expanded = expand_variables(glob, variables);
            match Pattern::new(&expanded) {
                Ok(pattern) => patterns.push(pattern),
                Err(e) => warn!(
                    "Changes glob '{}' expands to invalid pattern '{}': {}; treated as no match",
                    glob, expanded, e
                ),
            }
        }

        changed
            .iter()
            .any(|path| patterns.iter().any(|p| p.matches_with(path, PATH_MATCH)))
    }
}
