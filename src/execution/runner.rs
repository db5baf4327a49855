//! Script runner boundary - runs one opaque command

use crate::core::job::FailureClass;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Line prefix a script prints to report an infrastructure failure
pub const FAILURE_CLASS_MARKER: &str = "railyard-failure-class:";

/// Infrastructure failures; all of them are transient
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("Runner system failure: {0}")]
    System(String),

    #[error("Unknown failure: {0}")]
    Unknown(String),

    #[error("API failure: {0}")]
    Api(String),
}

impl RunnerError {
    pub fn class(&self) -> FailureClass {
        match self {
            RunnerError::System(_) => FailureClass::RunnerSystemFailure,
            RunnerError::Unknown(_) => FailureClass::UnknownFailure,
            RunnerError::Api(_) => FailureClass::ApiFailure,
        }
    }

    /// Build from a self-reported class name; only transient classes qualify
    pub fn from_reported(class: &str, message: String) -> Option<Self> {
        match class.trim() {
            "runner_system_failure" => Some(RunnerError::System(message)),
            "unknown_failure" => Some(RunnerError::Unknown(message)),
            "api_failure" => Some(RunnerError::Api(message)),
            _ => None,
        }
    }
}

/// Result of one finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr
    pub output: String,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs script steps
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run `command` with exactly `env` on top of the process environment
    async fn run(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        workdir: &Path,
    ) -> Result<StepOutput, RunnerError>;
}

/// Runs commands through `sh -c`
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    timeout_secs: u64,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh", 10800)
    }
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            shell: shell.into(),
            timeout_secs,
        }
    }
}

fn reported_failure(output: &str) -> Option<&str> {
    output
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(FAILURE_CLASS_MARKER))
}

#[async_trait]
impl ScriptRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        workdir: &Path,
    ) -> Result<StepOutput, RunnerError> {
        debug!("$ {}", command);

        let result = timeout(
            Duration::from_secs(self.timeout_secs),
            Command::new(&self.shell)
                .arg("-c")
                .arg(command)
                .envs(env)
                .current_dir(workdir)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| RunnerError::Unknown(format!("timeout after {} seconds", self.timeout_secs)))?;

        let output = result.map_err(|e| RunnerError::System(format!("failed to spawn {}: {}", self.shell, e)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        // Killed by a signal
        let Some(exit_code) = output.status.code() else {
            warn!("Command terminated by signal: {}", command);
            return Err(RunnerError::System("terminated by signal".to_string()));
        };

        if exit_code != 0 {
            if let Some(err) = reported_failure(&text)
                .and_then(|class| RunnerError::from_reported(class, format!("`{}` exited with {}", command, exit_code)))
            {
                return Err(err);
            }
        }

        Ok(StepOutput {
            exit_code,
            output: text,
        })
    }
}
