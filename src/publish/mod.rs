//! Image and description publishing
//!
//! Publish jobs run one of two fixed workflows instead of script steps:
//! build and push a container image from the build stage's bundle, or push
//! the repository description file to the registry.

pub mod builder;
pub mod description;
pub mod tags;

use crate::artifact::ArtifactBundle;
use crate::core::context::JobEnvironment;
use crate::core::job::FailureClass;
use crate::core::trigger::TriggerContext;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub use builder::{BuildahCli, BuilderError, ImageBuilder};
pub use description::{DescriptionError, DescriptionPublisher, DockerHubClient};
pub use tags::{derive_version, floating_tag, PublishSpec};

/// Publish workflow errors
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Registry credentials are missing (set {username_env} and {password_env})")]
    MissingCredentials {
        username_env: String,
        password_env: String,
    },

    #[error("No build artifacts with {0} are available")]
    MissingBuildArtifacts(String),

    #[error("Commit short SHA is not known")]
    MissingCommitSha,

    #[error("Ref '{0}' is not the protected branch")]
    UnprotectedRef(String),

    #[error("Description file {0} does not exist")]
    MissingReadme(PathBuf),

    #[error("Image build failed: {0}")]
    BuildFailed(#[source] BuilderError),

    #[error("Registry login failed: {0}")]
    LoginFailed(#[source] BuilderError),

    #[error("Push of tag '{tag}' failed: {reason}")]
    PushFailed {
        tag: String,
        reason: String,
        report: PublishReport,
    },

    #[error("Description update failed: {0}")]
    DescriptionFailed(#[from] DescriptionError),
}

impl PublishError {
    pub fn class(&self) -> FailureClass {
        match self {
            PublishError::MissingCredentials { .. }
            | PublishError::MissingBuildArtifacts(_)
            | PublishError::MissingCommitSha
            | PublishError::UnprotectedRef(_)
            | PublishError::MissingReadme(_) => FailureClass::Configuration,
            PublishError::BuildFailed(_) => FailureClass::ScriptFailure,
            PublishError::LoginFailed(_)
            | PublishError::PushFailed { .. }
            | PublishError::DescriptionFailed(_) => FailureClass::PublishFailure,
        }
    }

    /// Partial progress, when there was any
    pub fn report(&self) -> Option<&PublishReport> {
        match self {
            PublishError::PushFailed { report, .. } => Some(report),
            _ => None,
        }
    }
}

fn default_registry() -> String {
    "docker.io".to_string()
}

fn default_repository() -> String {
    "${CI_JOB_NAME}".to_string()
}

fn default_dockerfile() -> String {
    "ci.Dockerfile".to_string()
}

fn default_context() -> String {
    ".".to_string()
}

fn default_project() -> String {
    "${CI_JOB_NAME}".to_string()
}

fn default_username_env() -> String {
    "REGISTRY_USER".to_string()
}

fn default_password_env() -> String {
    "REGISTRY_PASSWORD".to_string()
}

fn default_protected_branch() -> String {
    "master".to_string()
}

fn default_readme() -> String {
    "docs/${CI_JOB_NAME}.README.md".to_string()
}

fn default_job_prefix() -> String {
    "dockerhub-".to_string()
}

fn default_api_url() -> String {
    "https://hub.docker.com".to_string()
}

/// Registry settings shared by all publish jobs of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_registry")]
    pub registry: String,

    #[serde(default)]
    pub organization: String,

    /// Repository name template, expanded per job
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Build description file, relative to the build context
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,

    /// Build context inside the build bundle, e.g. `artifacts/${CI_JOB_NAME}`
    #[serde(default = "default_context")]
    pub context: String,

    /// Value of the PROJECT build argument
    #[serde(default = "default_project")]
    pub project: String,

    /// Environment variable holding the registry user
    #[serde(default = "default_username_env")]
    pub username_env: String,

    /// Environment variable holding the registry password
    #[serde(default = "default_password_env")]
    pub password_env: String,

    #[serde(default)]
    pub description: DescriptionConfig,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            organization: String::new(),
            repository: default_repository(),
            dockerfile: default_dockerfile(),
            context: default_context(),
            project: default_project(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            description: DescriptionConfig::default(),
        }
    }
}

impl PublishConfig {
    /// `<registry>/<organization>/<repository>` for a job
    pub fn image_name(&self, env: &JobEnvironment) -> String {
        let repository = env.expand(&self.repository);
        if self.organization.is_empty() {
            format!("{}/{}", self.registry, repository)
        } else {
            format!("{}/{}/{}", self.registry, self.organization, repository)
        }
    }
}

/// Settings for description publish jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptionConfig {
    /// Only this ref may update descriptions
    #[serde(default = "default_protected_branch")]
    pub protected_branch: String,

    /// Description file template, relative to the workspace
    #[serde(default = "default_readme")]
    pub readme: String,

    /// Stripped from the job name to get the repository name
    #[serde(default = "default_job_prefix")]
    pub job_prefix: String,

    #[serde(default)]
    pub short_description: Option<String>,

    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for DescriptionConfig {
    fn default() -> Self {
        Self {
            protected_branch: default_protected_branch(),
            readme: default_readme(),
            job_prefix: default_job_prefix(),
            short_description: None,
            api_url: default_api_url(),
        }
    }
}

/// Registry username/password pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    /// Both parts must be non-empty
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Option<Self> {
        let username = username.into();
        let password = password.into();
        (!username.is_empty() && !password.is_empty()).then_some(Self { username, password })
    }

    /// Read the pair from the environment variables named in `config`
    pub fn from_env(config: &PublishConfig) -> Option<Self> {
        let username = std::env::var(&config.username_env).unwrap_or_default();
        let password = std::env::var(&config.password_env).unwrap_or_default();
        Self::new(username, password)
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// What a publish job did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    /// Image name or description repository
    pub target: String,
    pub version: Option<String>,
    pub floating_tag: Option<String>,
    /// Tags pushed, in order; never rolled back
    pub pushed: Vec<String>,
}

/// Runs the image and description workflows for publish jobs
pub struct PublishWorkflow {
    config: PublishConfig,
    credentials: Option<Credentials>,
    builder: Arc<dyn ImageBuilder>,
    describer: Arc<dyn DescriptionPublisher>,
}

impl PublishWorkflow {
    pub fn new(
        config: PublishConfig,
        credentials: Option<Credentials>,
        builder: Arc<dyn ImageBuilder>,
        describer: Arc<dyn DescriptionPublisher>,
    ) -> Self {
        Self {
            config,
            credentials,
            builder,
            describer,
        }
    }

    pub fn config(&self) -> &PublishConfig {
        &self.config
    }

    /// Secrets to mask in job output
    pub fn secrets(&self) -> Vec<String> {
        self.credentials
            .iter()
            .map(|c| c.password().to_string())
            .collect()
    }

    fn require_credentials(&self) -> Result<&Credentials, PublishError> {
        self.credentials
            .as_ref()
            .ok_or_else(|| PublishError::MissingCredentials {
                username_env: self.config.username_env.clone(),
                password_env: self.config.password_env.clone(),
            })
    }

    /// Locate the build context inside the visible bundles
    ///
    /// Index-only bundles (no location) resolve against the workspace.
    fn find_context(
        &self,
        env: &JobEnvironment,
        bundles: &[ArtifactBundle],
        workspace: &Path,
    ) -> Result<PathBuf, PublishError> {
        let relative = env.expand(&self.config.context);
        bundles
            .iter()
            .map(|b| b.location.as_deref().unwrap_or(workspace).join(&relative))
            .find(|dir| dir.join(&self.config.dockerfile).is_file())
            .ok_or_else(|| {
                PublishError::MissingBuildArtifacts(format!("{}/{}", relative, self.config.dockerfile))
            })
    }

    /// Build the image once and push its three tags in order
    ///
    /// Credentials are checked before anything else. A failed push stops
    /// the sequence; tags already pushed stay pushed.
    pub async fn publish_image(
        &self,
        env: &JobEnvironment,
        trigger: &TriggerContext,
        bundles: &[ArtifactBundle],
        workspace: &Path,
    ) -> Result<PublishReport, PublishError> {
        let credentials = self.require_credentials()?;
        let context_dir = self.find_context(env, bundles, workspace)?;
        let spec = PublishSpec::derive(&self.config, env, trigger, context_dir, Utc::now().date_naive())?;

        info!(
            "Building {} (version {}, floating tag {})",
            spec.image_name, spec.version, spec.floating_tag
        );
        self.builder.build(&spec).await.map_err(PublishError::BuildFailed)?;

        let mut report = PublishReport {
            target: spec.image_name.clone(),
            version: Some(spec.version.clone()),
            floating_tag: Some(spec.floating_tag.clone()),
            pushed: Vec::new(),
        };

        let result = self.push_all(&spec, credentials, &mut report).await;

        if let Err(e) = self.builder.logout().await {
            warn!("Registry logout failed: {}", e);
        }

        result.map(|_| report)
    }

    async fn push_all(
        &self,
        spec: &PublishSpec,
        credentials: &Credentials,
        report: &mut PublishReport,
    ) -> Result<(), PublishError> {
        self.builder
            .login(&self.config.registry, credentials)
            .await
            .map_err(PublishError::LoginFailed)?;

        for (tag, reference) in spec.tags.iter().zip(spec.references()) {
            if let Err(e) = self.builder.push(&reference).await {
                warn!("Push of {} failed after {} tag(s)", reference, report.pushed.len());
                return Err(PublishError::PushFailed {
                    tag: tag.clone(),
                    reason: e.to_string(),
                    report: report.clone(),
                });
            }
            info!("Pushed {}", reference);
            report.pushed.push(tag.clone());
        }
        Ok(())
    }

    /// Push the job's description file to the registry
    ///
    /// Only the protected branch may update descriptions.
    pub async fn publish_description(
        &self,
        env: &JobEnvironment,
        trigger: &TriggerContext,
        workspace: &Path,
    ) -> Result<PublishReport, PublishError> {
        let credentials = self.require_credentials()?;
        let settings = &self.config.description;

        if trigger.ref_name() != settings.protected_branch {
            return Err(PublishError::UnprotectedRef(trigger.ref_name().to_string()));
        }

        let readme = workspace.join(env.expand(&settings.readme));
        let full_description = tokio::fs::read_to_string(&readme)
            .await
            .map_err(|_| PublishError::MissingReadme(readme.clone()))?;

        let job_name = env
            .get_variable(crate::core::context::CI_JOB_NAME)
            .map(String::as_str)
            .unwrap_or_default();
        let repository_name = job_name.strip_prefix(&settings.job_prefix).unwrap_or(job_name);
        let repository = if self.config.organization.is_empty() {
            repository_name.to_string()
        } else {
            format!("{}/{}", self.config.organization, repository_name)
        };

        self.describer
            .publish(
                &repository,
                &full_description,
                settings.short_description.as_deref(),
                credentials,
            )
            .await?;

        Ok(PublishReport {
            target: repository,
            ..Default::default()
        })
    }
}
