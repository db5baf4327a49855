//! CLI command definitions

use crate::core::trigger::RawTrigger;
use crate::execution::SchedulingStrategy;
use clap::Args;
use std::path::PathBuf;

/// Trigger facts; unset flags fall back to the CI environment
#[derive(Debug, Args, Clone, Default)]
pub struct TriggerArgs {
    /// What started the pipeline (push, web, schedule, pipeline, ...)
    #[arg(long, env = "CI_PIPELINE_SOURCE")]
    pub source: Option<String>,

    /// Branch or tag name
    #[arg(long = "ref", env = "CI_COMMIT_REF_NAME")]
    pub ref_name: Option<String>,

    /// Tag name when the ref is a tag
    #[arg(long, env = "CI_COMMIT_TAG")]
    pub tag: Option<String>,

    /// Short commit hash
    #[arg(long, env = "CI_COMMIT_SHORT_SHA")]
    pub sha: Option<String>,

    /// Changed file path (repeatable); defaults to CI_CHANGED_FILES
    #[arg(long)]
    pub changed: Vec<String>,
}

impl TriggerArgs {
    /// Merge flags over the environment
    ///
    /// A `--var` named like the pipeline's schedule variable labels the run.
    pub fn to_raw(&self, schedule_var: Option<&str>, vars: &[(String, String)]) -> RawTrigger {
        let mut raw = RawTrigger::from_env(schedule_var);

        if let Some(source) = &self.source {
            raw.source = source.clone();
        }
        if let Some(ref_name) = &self.ref_name {
            raw.ref_name = ref_name.clone();
        }
        if self.tag.is_some() {
            raw.commit_tag = self.tag.clone().filter(|t| !t.is_empty());
        }
        if self.sha.is_some() {
            raw.commit_short_sha = self.sha.clone().filter(|s| !s.is_empty());
        }
        if !self.changed.is_empty() {
            raw.changed_paths = Some(self.changed.clone());
        }
        if let Some(name) = schedule_var {
            if let Some((_, value)) = vars.iter().rev().find(|(key, _)| key == name) {
                raw.schedule_variable = Some((name.to_string(), value.clone()));
            }
        }

        raw
    }
}

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    #[command(flatten)]
    pub trigger: TriggerArgs,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub var: Vec<(String, String)>,

    /// sequential, parallel, parallel-limited or parallel-limited:N
    #[arg(long, default_value = "parallel")]
    pub strategy: SchedulingStrategy,

    /// Directory the job scripts run in
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Where artifact bundles are kept (default: <workspace>/.railyard/artifacts)
    #[arg(long)]
    pub artifacts: Option<PathBuf>,

    /// Don't save execution to history
    #[arg(long)]
    pub no_history: bool,
}

/// Show the jobs a trigger includes
#[derive(Debug, Args, Clone)]
pub struct PlanCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    #[command(flatten)]
    pub trigger: TriggerArgs,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub var: Vec<(String, String)>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show full details
    #[arg(long)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a specific execution
    #[arg(long)]
    pub execution_id: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
