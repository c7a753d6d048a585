use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ksync_core::{default_key_fields, FileNamingRule};
use ksync_storage::{
    BackoffPolicy, DownloadOptions, HttpClientConfig, RemoteCallPolicy, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};

/// Process-level settings. Passed explicitly to every stage; nothing here is global.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub remote_timeout_secs: u64,
    pub remote_max_retries: usize,
    /// Downloads allowed in a burst; `None` leaves downloads unthrottled.
    pub rate_limit_capacity: Option<u32>,
    pub rate_limit_refill_ms: u64,
    pub debug_entries: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./store"),
            reports_dir: PathBuf::from("./reports"),
            user_agent: "ksync-bot/0.1".to_string(),
            http_timeout_secs: 20,
            remote_timeout_secs: 30,
            remote_max_retries: 3,
            rate_limit_capacity: None,
            rate_limit_refill_ms: 1000,
            debug_entries: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_dir: std::env::var("KSYNC_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_dir),
            reports_dir: std::env::var("KSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            user_agent: std::env::var("KSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("KSYNC_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            remote_timeout_secs: env_parse("KSYNC_REMOTE_TIMEOUT_SECS")
                .unwrap_or(defaults.remote_timeout_secs),
            remote_max_retries: env_parse("KSYNC_REMOTE_MAX_RETRIES")
                .unwrap_or(defaults.remote_max_retries),
            rate_limit_capacity: env_parse("KSYNC_RATE_LIMIT_CAPACITY").or(defaults.rate_limit_capacity),
            rate_limit_refill_ms: env_parse("KSYNC_RATE_LIMIT_REFILL_MS")
                .unwrap_or(defaults.rate_limit_refill_ms),
            debug_entries: std::env::var("KSYNC_DEBUG_ENTRIES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn remote_policy(&self) -> RemoteCallPolicy {
        RemoteCallPolicy {
            timeout: Duration::from_secs(self.remote_timeout_secs),
            backoff: BackoffPolicy {
                max_retries: self.remote_max_retries,
                ..Default::default()
            },
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: self
                .rate_limit_capacity
                .filter(|capacity| *capacity > 0)
                .map(|capacity| TokenBucketConfig {
                    capacity,
                    refill_every: Duration::from_millis(self.rate_limit_refill_ms),
                }),
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Who a created file belongs to, and which entry fields fingerprint it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationScope {
    pub created_by_app: Option<String>,
    pub source_account_identifier: Option<String>,
    #[serde(default)]
    pub file_id_attributes: Vec<String>,
}

impl DestinationScope {
    /// Metadata lookups need all three parts.
    pub fn fingerprint_ready(&self) -> bool {
        !self.file_id_attributes.is_empty()
            && self.created_by_app.as_deref().is_some_and(|s| !s.is_empty())
            && self
                .source_account_identifier
                .as_deref()
                .is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileOptions {
    #[serde(default)]
    pub naming: Option<FileNamingRule>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub scope: DestinationScope,
    #[serde(default)]
    pub download: DownloadOptions,
    /// Wall-clock budget for saving files and records in one run. Entries
    /// still pending when it runs out are left for the next run.
    #[serde(default)]
    pub time_budget_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    pub collection: String,
    pub match_fields: Vec<String>,
}

/// Per-connector settings, usually read from a YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    pub model: String,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default = "default_key_fields")]
    pub key_fields: Vec<String>,
    #[serde(default)]
    pub files: FileOptions,
    #[serde(default)]
    pub reconcile: Option<ReconcileConfig>,
}

impl ConnectorConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing connector config")
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
