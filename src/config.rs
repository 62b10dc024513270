//! Configuration types
//!
//! Loaded once from a JSON file at startup and read-only afterwards.
//! Composed of focused sub-configs: cross-account role settings, the
//! optional static account list, sink settings, and runtime flags.

use crate::accounts::Account;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Cross-account access settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleConfig {
    /// Role assumed in every governed account
    pub role_name: String,
    /// External id required by the role's trust policy
    pub external_id: String,
    /// Account the tool itself runs in
    pub main_account: String,
}

/// Sink (Elasticsearch) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ElasticsearchConfig {
    /// Cluster base URL
    pub endpoint: String,
    /// Index for per-pass metrics documents
    #[serde(default = "default_metrics_index")]
    pub metrics_index: String,
    /// Daily event index prefix
    #[serde(default = "default_events_index_prefix")]
    pub events_index_prefix: String,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub role: RoleConfig,
    /// Static account list; when absent the directory is fed from the
    /// Organizations API
    #[serde(default)]
    pub accounts: Option<Vec<Account>>,
    /// Region override; when absent regions are discovered per process
    #[serde(default)]
    pub regions: Option<Vec<String>>,
    /// Region used for role assumption and region discovery
    #[serde(default = "default_region")]
    pub default_region: String,
    #[serde(default)]
    pub elasticsearch: Option<ElasticsearchConfig>,
    /// Dry-run governance: log would-be tag mutations instead of
    /// committing them
    #[serde(default = "default_pretend")]
    pub pretend: bool,
    /// SQS queue delivering CloudTrail bucket notifications
    #[serde(default)]
    pub queue_url: Option<String>,
    /// Namespace prefix for governance tags
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_pretend() -> bool {
    true
}

fn default_tag_prefix() -> String {
    "policy:".to_string()
}

fn default_metrics_index() -> String {
    "metrics".to_string()
}

fn default_events_index_prefix() -> String {
    "logstash-".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}
