//! Artifact bundles - named, expiring outputs of successful jobs

pub mod store;

use crate::core::config::ConfigError;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;
use uuid::Uuid;

pub use store::ArtifactStore;

/// Errors raised while capturing or restoring bundles
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Bundle for job '{0}' already stored for this run")]
    AlreadyStored(String),

    #[error("Invalid artifact path pattern '{0}'")]
    InvalidPattern(String),

    #[error("Artifact task failed: {0}")]
    Task(String),
}

/// A stored set of files produced by one successful job. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    /// Execution that produced the bundle
    pub run_id: Uuid,

    pub owner_job: String,

    /// Stage index of the producer
    pub owner_stage: usize,

    /// Expanded bundle name, `<job>_<ref>` by default
    pub name: String,

    /// Captured paths, relative to the bundle location
    pub paths: Vec<PathBuf>,

    /// Directory holding the captured files; `None` for index-only stores
    pub location: Option<PathBuf>,

    #[serde(with = "duration_secs")]
    pub expire_in: Duration,

    pub created_at: DateTime<Utc>,
}

impl ArtifactBundle {
    /// Expired bundles must never be served
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > self.expire_in
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + self.expire_in
    }
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        i64::deserialize(d).map(Duration::seconds)
    }
}

fn expiry_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\s*([A-Za-z]+)\s*$").expect("expiry pattern is valid")
    })
}

/// Parse a retention string such as `7 days`, `12 hours`, `30 min` or `1 week`
pub fn parse_expiry(text: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidExpiry(text.to_string());

    let caps = expiry_pattern().captures(text).ok_or_else(invalid)?;
    let amount: i64 = caps[1].parse().map_err(|_| invalid())?;

    let duration = match caps[2].to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => Duration::seconds(amount),
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::minutes(amount),
        "h" | "hr" | "hrs" | "hour" | "hours" => Duration::hours(amount),
        "d" | "day" | "days" => Duration::days(amount),
        "w" | "wk" | "week" | "weeks" => Duration::weeks(amount),
        _ => return Err(invalid()),
    };

    Ok(duration)
}
