//! Pipeline domain model and the per-run job graph

use crate::artifact::parse_expiry;
use crate::core::{
    config::{ConfigError, PipelineConfig, RulesConfig},
    context::JobEnvironment,
    job::{JobDefaults, JobDefinition, RetryPolicy},
    rule::{evaluate, Rule, RuleSet, Verdict},
    state::{JobState, PipelineState, StageStatus},
    trigger::TriggerContext,
};
use crate::publish::{PublishConfig, PublishReport};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building the job graph for a run
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Job '{job}' needs '{need}', which is not part of this run")]
    UnsatisfiedNeed { job: String, need: String },

    #[error("Job '{job}' needs '{need}', which runs in a later stage")]
    NeedInLaterStage { job: String, need: String },
}

/// A validated pipeline definition
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Ordered stage names
    pub stages: Vec<String>,

    /// Global variables available to all jobs
    pub variables: HashMap<String, String>,

    /// Variable that labels scheduled runs
    pub schedule_variable: Option<String>,

    /// Job definitions in file order
    pub jobs: Vec<Arc<JobDefinition>>,

    /// Registry settings for publish jobs
    pub publish: Option<PublishConfig>,
}

fn compile_rules(rules: &[crate::core::config::RuleConfig]) -> Result<RuleSet, ConfigError> {
    let compiled = rules.iter().map(Rule::from_config).collect::<Result<Vec<_>, _>>()?;
    Ok(Arc::from(compiled))
}

impl Pipeline {
    /// Create a pipeline from configuration
    ///
    /// Named rule sets are compiled once and shared by every job that
    /// references them.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let defaults = JobDefaults {
            retry: match &config.defaults.retry {
                Some(retry) => RetryPolicy::from_config("defaults", retry)?,
                None => RetryPolicy::default(),
            },
            interruptible: config.defaults.interruptible.unwrap_or(false),
            artifact_expiry: match &config.defaults.artifact_expiry {
                Some(text) => parse_expiry(text)?,
                None => JobDefaults::default().artifact_expiry,
            },
        };

        let rule_sets: BTreeMap<&str, RuleSet> = config
            .rule_sets
            .iter()
            .map(|(name, rules)| compile_rules(rules).map(|set| (name.as_str(), set)))
            .collect::<Result<_, _>>()?;

        let mut jobs = Vec::with_capacity(config.jobs.len());
        for job in &config.jobs {
            let stage_index = config
                .stages
                .iter()
                .position(|s| s == &job.stage)
                .ok_or_else(|| ConfigError::UnknownStage {
                    job: job.name.clone(),
                    stage: job.stage.clone(),
                })?;

            let rules = match &job.rules {
                None => Arc::from(Vec::new()),
                Some(RulesConfig::Inline(rules)) => compile_rules(rules)?,
                Some(RulesConfig::Named(name)) => rule_sets
                    .get(name.as_str())
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownRuleSet {
                        job: job.name.clone(),
                        name: name.clone(),
                    })?,
            };

            jobs.push(Arc::new(JobDefinition::from_config(job, stage_index, rules, &defaults)?));
        }

        Ok(Pipeline {
            name: config.name.clone(),
            stages: config.stages.clone(),
            variables: config.variables.clone(),
            schedule_variable: config.schedule_variable.clone(),
            jobs,
            publish: config.publish.clone(),
        })
    }

    /// Get a job by name
    pub fn job(&self, name: &str) -> Option<&Arc<JobDefinition>> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// One included job in a run
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub job: Arc<JobDefinition>,

    /// Variables the job sees
    pub environment: JobEnvironment,

    pub state: JobState,

    /// Captured, masked output of all attempts
    pub log: String,

    /// Set for image publish jobs once they ran
    pub publish: Option<PublishReport>,
}

/// Included jobs of one stage
#[derive(Debug, Clone)]
pub struct StageGroup {
    pub name: String,
    /// Job names in dependency order
    pub jobs: Vec<String>,
    pub status: StageStatus,
}

/// Dry-run view of a job graph
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub pipeline: String,
    pub source: String,
    pub ref_name: String,
    pub stages: Vec<PlannedStage>,
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStage {
    pub name: String,
    pub jobs: Vec<PlannedJob>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub name: String,
    pub manual: bool,
    pub allow_failure: bool,
    pub needs: Vec<String>,
}

/// Concrete DAG of included jobs for one run, grouped by stage
#[derive(Debug, Clone)]
pub struct JobGraph {
    pub pipeline_name: String,
    pub trigger: TriggerContext,
    pub stages: Vec<StageGroup>,
    pub state: PipelineState,
    nodes: HashMap<String, GraphNode>,
    excluded: Vec<String>,
}

impl JobGraph {
    /// Evaluate every job's rules and keep the included ones
    ///
    /// Fails when an included job needs a job that is excluded from this run.
    pub fn build(pipeline: &Pipeline, trigger: &TriggerContext) -> Result<Self, GraphError> {
        let mut nodes = HashMap::new();
        let mut excluded = Vec::new();

        for job in &pipeline.jobs {
            let environment = JobEnvironment::for_job(
                &job.name,
                &job.stage,
                trigger,
                &pipeline.variables,
                &job.variables,
            );

            match evaluate(&job.rules, trigger, &environment.variables) {
                Verdict::Exclude => excluded.push(job.name.clone()),
                Verdict::Include { runs_now } => {
                    let state = if runs_now { JobState::Pending } else { JobState::Manual };
                    nodes.insert(
                        job.name.clone(),
                        GraphNode {
                            job: Arc::clone(job),
                            environment,
                            state,
                            log: String::new(),
                            publish: None,
                        },
                    );
                }
            }
        }

        for node in nodes.values() {
            for need in &node.job.needs {
                let Some(producer) = nodes.get(need) else {
                    return Err(GraphError::UnsatisfiedNeed {
                        job: node.job.name.clone(),
                        need: need.clone(),
                    });
                };
                if producer.job.stage_index > node.job.stage_index {
                    return Err(GraphError::NeedInLaterStage {
                        job: node.job.name.clone(),
                        need: need.clone(),
                    });
                }
            }
        }

        let order = Self::topological_sort(pipeline, &nodes);
        let stages = pipeline
            .stages
            .iter()
            .enumerate()
            .map(|(index, name)| StageGroup {
                name: name.clone(),
                jobs: order
                    .iter()
                    .filter(|j| nodes.get(*j).is_some_and(|n| n.job.stage_index == index))
                    .cloned()
                    .collect(),
                status: StageStatus::Pending,
            })
            .collect();

        Ok(JobGraph {
            pipeline_name: pipeline.name.clone(),
            trigger: trigger.clone(),
            stages,
            state: PipelineState::new(),
            nodes,
            excluded,
        })
    }

    /// Jobs in `needs` order, ties broken by definition order
    fn topological_sort(pipeline: &Pipeline, nodes: &HashMap<String, GraphNode>) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();

        for job in &pipeline.jobs {
            if nodes.contains_key(&job.name) {
                Self::visit(&job.name, nodes, &mut visited, &mut result);
            }
        }

        result
    }

    fn visit(
        name: &str,
        nodes: &HashMap<String, GraphNode>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(name.to_string()) {
            return;
        }

        if let Some(node) = nodes.get(name) {
            for need in &node.job.needs {
                Self::visit(need, nodes, visited, result);
            }
        }

        result.push(name.to_string());
    }

    /// Get a node by job name
    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    /// Get a mutable node by job name
    pub fn node_mut(&mut self, name: &str) -> Option<&mut GraphNode> {
        self.nodes.get_mut(name)
    }

    /// Included nodes in stage and dependency order
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.stages
            .iter()
            .flat_map(|s| s.jobs.iter())
            .filter_map(|name| self.nodes.get(name))
    }

    /// Number of included jobs
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names of jobs the rule engine left out
    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    /// Jobs of a stage that may start now
    pub fn ready_jobs(&self, stage: usize) -> Vec<&GraphNode> {
        self.stage_nodes(stage)
            .filter(|n| matches!(n.state, JobState::Pending))
            .filter(|n| {
                n.job
                    .needs
                    .iter()
                    .all(|need| self.nodes.get(need).is_some_and(|p| p.state.satisfies_needs()))
            })
            .collect()
    }

    /// Pending jobs whose needs can no longer be satisfied
    pub fn blocked_jobs(&self, stage: usize) -> Vec<(String, String)> {
        self.stage_nodes(stage)
            .filter(|n| matches!(n.state, JobState::Pending))
            .filter_map(|n| {
                n.job.needs.iter().find_map(|need| {
                    let producer = self.nodes.get(need)?;
                    let dead = matches!(producer.state, JobState::Manual)
                        || (producer.state.is_terminal() && !producer.state.satisfies_needs());
                    dead.then(|| {
                        (
                            n.job.name.clone(),
                            format!("needed job '{}' is {}", need, producer.state.label()),
                        )
                    })
                })
            })
            .collect()
    }

    /// Jobs currently running
    pub fn running_jobs(&self) -> Vec<&GraphNode> {
        self.nodes
            .values()
            .filter(|n| matches!(n.state, JobState::Running { .. }))
            .collect()
    }

    fn stage_nodes(&self, stage: usize) -> impl Iterator<Item = &GraphNode> {
        self.stages
            .get(stage)
            .into_iter()
            .flat_map(|s| s.jobs.iter())
            .filter_map(|name| self.nodes.get(name))
    }

    /// Derive a stage's status from its jobs
    ///
    /// Manual and skipped jobs never block a stage.
    pub fn stage_status(&self, stage: usize) -> StageStatus {
        let mut started = false;
        let mut unresolved = false;
        let mut allowed_failure = false;
        let mut blocking_failure = false;

        for node in self.stage_nodes(stage) {
            match &node.state {
                JobState::Pending => unresolved = true,
                JobState::Running { .. } => {
                    started = true;
                    unresolved = true;
                }
                JobState::Failed { allowed: true, .. } => allowed_failure = true,
                state if state.is_blocking_failure() => blocking_failure = true,
                _ => {}
            }
            started |= node.state.is_terminal();
        }

        match (unresolved, started) {
            (true, false) => StageStatus::Pending,
            (true, true) => StageStatus::Running,
            _ if blocking_failure => StageStatus::Failed,
            _ if allowed_failure => StageStatus::PartiallyFailedAllowed,
            _ => StageStatus::Succeeded,
        }
    }

    /// Register a value to mask in every job's output
    pub fn register_secret(&mut self, value: &str) {
        for node in self.nodes.values_mut() {
            node.environment.add_secret(value);
        }
    }

    /// Render the included jobs per stage without running anything
    pub fn plan(&self) -> Plan {
        Plan {
            pipeline: self.pipeline_name.clone(),
            source: self.trigger.source().to_string(),
            ref_name: self.trigger.ref_name().to_string(),
            stages: self
                .stages
                .iter()
                .filter(|s| !s.jobs.is_empty())
                .map(|s| PlannedStage {
                    name: s.name.clone(),
                    jobs: s
                        .jobs
                        .iter()
                        .filter_map(|name| self.nodes.get(name))
                        .map(|n| PlannedJob {
                            name: n.job.name.clone(),
                            manual: matches!(n.state, JobState::Manual),
                            allow_failure: n.job.allow_failure,
                            needs: n.job.needs.clone(),
                        })
                        .collect(),
                })
                .collect(),
            excluded: self.excluded.clone(),
        }
    }
}
