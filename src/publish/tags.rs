//! Version and tag derivation for image publishing

use crate::core::context::JobEnvironment;
use crate::core::trigger::TriggerContext;
use crate::publish::{PublishConfig, PublishError};
use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

pub const PRODUCTION_TAG: &str = "production";
pub const LATEST_TAG: &str = "latest";

fn release_ref() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^v[0-9]+\.[0-9]+.*$").expect("release pattern is valid"))
}

fn slashes() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("/+").expect("slash pattern is valid"))
}

/// `VERSION`: the commit tag, else the ref name with each run of `/` replaced by `-`
pub fn derive_version(trigger: &TriggerContext) -> String {
    match trigger.commit_tag() {
        Some(tag) => tag.to_string(),
        None => slashes().replace_all(trigger.ref_name(), "-").into_owned(),
    }
}

/// `production` for release refs (`v<major>.<minor>...`), else `latest`
pub fn floating_tag(ref_name: &str) -> &'static str {
    if release_ref().is_match(ref_name) {
        PRODUCTION_TAG
    } else {
        LATEST_TAG
    }
}

/// Everything needed to build and push one image. Computed per run, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishSpec {
    /// Image name without tag, e.g. `docker.io/paritytech/substrate-relay`
    pub image_name: String,
    pub version: String,
    pub floating_tag: String,
    /// Push order: version, `sha-<short>`, floating
    pub tags: Vec<String>,
    pub dockerfile: PathBuf,
    pub context_dir: PathBuf,
    pub build_args: BTreeMap<String, String>,
}

impl PublishSpec {
    /// Derive build and push settings for a publish job
    pub fn derive(
        config: &PublishConfig,
        env: &JobEnvironment,
        trigger: &TriggerContext,
        context_dir: PathBuf,
        build_date: NaiveDate,
    ) -> Result<Self, PublishError> {
        let short_sha = trigger
            .commit_short_sha()
            .ok_or(PublishError::MissingCommitSha)?;

        let version = derive_version(trigger);
        let floating = floating_tag(trigger.ref_name()).to_string();
        let image_name = config.image_name(env);
        let project = env.expand(&config.project);

        let build_args = BTreeMap::from([
            ("VCS_REF".to_string(), short_sha.to_string()),
            ("BUILD_DATE".to_string(), build_date.format("%d-%m-%Y").to_string()),
            ("PROJECT".to_string(), project),
            ("VERSION".to_string(), version.clone()),
        ]);

        let tags = vec![version.clone(), format!("sha-{}", short_sha), floating.clone()];

        Ok(PublishSpec {
            image_name,
            version,
            floating_tag: floating,
            tags,
            dockerfile: context_dir.join(&config.dockerfile),
            context_dir,
            build_args,
        })
    }

    /// `<image>:<tag>` for every tag, in push order
    pub fn references(&self) -> Vec<String> {
        self.tags
            .iter()
            .map(|tag| format!("{}:{}", self.image_name, tag))
            .collect()
    }
}
