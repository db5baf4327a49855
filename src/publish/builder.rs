//! Image builder boundary - buildah subprocess

use crate::publish::{tags::PublishSpec, Credentials};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Errors from the image build tool
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("Failed to spawn {0}")]
    Spawn(String),

    #[error("`{command}` exited with code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Timeout after {0} seconds")]
    Timeout(u64),
}

/// Builds, tags and pushes container images
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build one image carrying every tag of `spec`; returns the build log
    async fn build(&self, spec: &PublishSpec) -> Result<String, BuilderError>;

    async fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), BuilderError>;

    /// Push a single `<image>:<tag>` reference
    async fn push(&self, reference: &str) -> Result<(), BuilderError>;

    async fn logout(&self) -> Result<(), BuilderError>;
}

/// `buildah` CLI client
#[derive(Debug, Clone)]
pub struct BuildahCli {
    program: String,
    timeout_secs: u64,
}

impl Default for BuildahCli {
    fn default() -> Self {
        Self::new("buildah", 3600)
    }
}

impl BuildahCli {
    pub fn new(program: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            program: program.into(),
            timeout_secs,
        }
    }

    /// Arguments of the `bud` invocation for a spec
    pub fn build_args(spec: &PublishSpec) -> Vec<String> {
        let mut args = vec!["bud".to_string(), "--format=docker".to_string()];
        for (key, value) in &spec.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        for reference in spec.references() {
            args.push("--tag".to_string());
            args.push(reference);
        }
        args.push("--file".to_string());
        args.push(spec.dockerfile.to_string_lossy().into_owned());
        args.push(spec.context_dir.to_string_lossy().into_owned());
        args
    }

    async fn run(&self, args: &[String], stdin: Option<&str>) -> Result<String, BuilderError> {
        let command_line = format!("{} {}", self.program, args.first().map_or("", String::as_str));
        debug!("Running {}", command_line);

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuilderError::Spawn(format!("{}: {}", self.program, e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| BuilderError::Spawn(format!("{}: {}", self.program, e)))?;
        }

        let output = timeout(Duration::from_secs(self.timeout_secs), child.wait_with_output())
            .await
            .map_err(|_| BuilderError::Timeout(self.timeout_secs))?
            .map_err(|e| BuilderError::Spawn(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = output.status.code().unwrap_or(-1);
            warn!("{} exited with code {}: {}", command_line, code, stderr);
            return Err(BuilderError::Failed {
                command: command_line,
                code,
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ImageBuilder for BuildahCli {
    async fn build(&self, spec: &PublishSpec) -> Result<String, BuilderError> {
        self.run(&Self::build_args(spec), None).await
    }

    async fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), BuilderError> {
        let args = [
            "login".to_string(),
            "--username".to_string(),
            credentials.username.clone(),
            "--password-stdin".to_string(),
            registry.to_string(),
        ];
        self.run(&args, Some(credentials.password())).await.map(|_| ())
    }

    async fn push(&self, reference: &str) -> Result<(), BuilderError> {
        let args = ["push".to_string(), "--format=v2s2".to_string(), reference.to_string()];
        self.run(&args, None).await.map(|_| ())
    }

    async fn logout(&self) -> Result<(), BuilderError> {
        self.run(&["logout".to_string(), "--all".to_string()], None)
            .await
            .map(|_| ())
    }
}
