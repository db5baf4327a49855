//! Registry description publishing (Docker Hub repository README)

use crate::publish::Credentials;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Registry rejected the credentials")]
    Unauthorized,

    #[error("Repository {0} not found")]
    NotFound(String),

    #[error("Registry error: {0}")]
    Server(String),
}

/// Updates the human-readable description of a registry repository
#[async_trait]
pub trait DescriptionPublisher: Send + Sync {
    async fn publish(
        &self,
        repository: &str,
        full_description: &str,
        short_description: Option<&str>,
        credentials: &Credentials,
    ) -> Result<(), DescriptionError>;
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

/// Docker Hub API client
#[derive(Debug, Clone)]
pub struct DockerHubClient {
    client: Client,
    base_url: String,
}

impl Default for DockerHubClient {
    fn default() -> Self {
        Self::new("https://hub.docker.com")
    }
}

impl DockerHubClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn login(&self, credentials: &Credentials) -> Result<String, DescriptionError> {
        let payload = serde_json::json!({
            "username": credentials.username,
            "password": credentials.password(),
        });

        let res = self
            .client
            .post(format!("{}/v2/users/login", self.base_url))
            .json(&payload)
            .send()
            .await?;

        match res.status() {
            StatusCode::OK => Ok(res.json::<LoginResponse>().await?.token),
            StatusCode::UNAUTHORIZED => Err(DescriptionError::Unauthorized),
            status => Err(DescriptionError::Server(status.to_string())),
        }
    }
}

#[async_trait]
impl DescriptionPublisher for DockerHubClient {
    async fn publish(
        &self,
        repository: &str,
        full_description: &str,
        short_description: Option<&str>,
        credentials: &Credentials,
    ) -> Result<(), DescriptionError> {
        let token = self.login(credentials).await?;
        debug!("Logged in to {} as {}", self.base_url, credentials.username);

        let mut payload = serde_json::json!({ "full_description": full_description });
        if let Some(short) = short_description {
            payload["description"] = serde_json::Value::String(short.to_string());
        }

        let res = self
            .client
            .patch(format!("{}/v2/repositories/{}/", self.base_url, repository))
            .header("Authorization", format!("JWT {}", token))
            .json(&payload)
            .send()
            .await?;

        match res.status() {
            StatusCode::OK => {
                info!("Updated description of {}", repository);
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(DescriptionError::NotFound(repository.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DescriptionError::Unauthorized),
            status => Err(DescriptionError::Server(status.to_string())),
        }
    }
}
