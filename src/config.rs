use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::ErrorCategory;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub remote: RemoteConfig,
    pub admin: AdminConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[serde(rename = "sled")]
    Sled { data_dir: String },
    #[serde(rename = "memory")]
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sled {
            data_dir: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// gRPC endpoint of the remote store, e.g. `http://127.0.0.1:7000`.
    pub address: String,
    pub auth_token: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:7000".to_string(),
            auth_token: None,
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub http_addr: String,
    pub max_body_bytes: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:9100".to_string(),
            max_body_bytes: 128 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Dispatches allowed in flight at once (different record ids only).
    pub max_concurrency: usize,
    /// Non-terminal operations accepted before enqueue is refused.
    pub max_queue_len: usize,
    pub request_timeout_ms: u64,
    /// How long `success` rows are kept before the engine purges them.
    /// Zero keeps them until `purge_completed` is called.
    pub completed_retention_ms: u64,
    pub breaker: BreakerConfig,
    pub budget: BudgetConfig,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_queue_len: 10_000,
            request_timeout_ms: 30_000,
            completed_retention_ms: 600_000,
            breaker: BreakerConfig::default(),
            budget: BudgetConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Failures further apart than this do not count as consecutive.
    pub failure_window_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub limit: u32,
    pub window_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_min: f64,
    pub jitter_max: f64,
    pub max_attempts: AttemptLimits,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter_min: 0.5,
            jitter_max: 1.5,
            max_attempts: AttemptLimits::default(),
        }
    }
}

/// Total dispatch attempts allowed per retryable category.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptLimits {
    pub network: u32,
    pub server_error: u32,
    pub rate_limit: u32,
    pub authentication: u32,
    pub unknown: u32,
}

impl Default for AttemptLimits {
    fn default() -> Self {
        Self {
            network: 5,
            server_error: 5,
            rate_limit: 5,
            authentication: 1,
            unknown: 2,
        }
    }
}

impl AttemptLimits {
    /// `None` for categories that are never retried automatically.
    pub fn for_category(&self, category: ErrorCategory) -> Option<u32> {
        match category {
            ErrorCategory::Network => Some(self.network),
            ErrorCategory::ServerError => Some(self.server_error),
            ErrorCategory::RateLimit => Some(self.rate_limit),
            ErrorCategory::Authentication => Some(self.authentication),
            ErrorCategory::Unknown => Some(self.unknown),
            ErrorCategory::ClientError | ErrorCategory::Conflict => None,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Apply `SYNCLINE_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("SYNCLINE_DATA_DIR") {
            self.storage = StorageConfig::Sled { data_dir: dir };
        }
        if let Ok(addr) = std::env::var("SYNCLINE_REMOTE_ADDR") {
            self.remote.address = addr;
        }
        if let Ok(token) = std::env::var("SYNCLINE_AUTH_TOKEN") {
            self.remote.auth_token = Some(token);
        }
        if let Ok(addr) = std::env::var("SYNCLINE_ADMIN_ADDR") {
            self.admin.http_addr = addr;
        }
        if let Some(n) = std::env::var("SYNCLINE_MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
        {
            self.sync.max_concurrency = n;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sync = &self.sync;
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if sync.max_concurrency == 0 {
            return invalid("sync.max_concurrency must be > 0");
        }
        if sync.max_queue_len == 0 {
            return invalid("sync.max_queue_len must be > 0");
        }
        if sync.request_timeout_ms == 0 {
            return invalid("sync.request_timeout_ms must be > 0");
        }
        if sync.breaker.failure_threshold == 0 {
            return invalid("sync.breaker.failure_threshold must be > 0");
        }
        if sync.budget.limit == 0 || sync.budget.window_ms == 0 {
            return invalid("sync.budget limit and window_ms must be > 0");
        }
        if sync.retry.jitter_min <= 0.0 || sync.retry.jitter_min > sync.retry.jitter_max {
            return invalid("sync.retry jitter range must satisfy 0 < jitter_min <= jitter_max");
        }
        if sync.retry.base_delay_ms > sync.retry.max_delay_ms {
            return invalid("sync.retry.base_delay_ms must not exceed max_delay_ms");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_config_default_uses_sled_data_dir() {
        let cfg = StorageConfig::default();
        match cfg {
            StorageConfig::Sled { data_dir } => {
                assert_eq!(data_dir, "./data");
            }
            other => panic!("unexpected storage config: {other:?}"),
        }
    }

    #[test]
    fn config_default_values_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.breaker.failure_threshold, 5);
        assert_eq!(cfg.sync.budget.limit, 100);
        assert_eq!(cfg.sync.budget.window_ms, 60_000);
        assert_eq!(cfg.sync.retry.max_attempts.authentication, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"storage":{"type":"memory"},"sync":{"budget":{"limit":7}}}"#,
        )
        .unwrap();
        assert!(matches!(cfg.storage, StorageConfig::Memory));
        assert_eq!(cfg.sync.budget.limit, 7);
        assert_eq!(cfg.sync.budget.window_ms, 60_000);
        assert_eq!(cfg.sync.max_concurrency, 4);
        assert_eq!(cfg.sync.completed_retention_ms, 600_000);
    }

    #[test]
    fn validate_rejects_inverted_jitter() {
        let mut cfg = Config::default();
        cfg.sync.retry.jitter_min = 2.0;
        cfg.sync.retry.jitter_max = 1.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn attempt_limits_exclude_non_retryable_categories() {
        let limits = AttemptLimits::default();
        assert_eq!(limits.for_category(ErrorCategory::Conflict), None);
        assert_eq!(limits.for_category(ErrorCategory::ClientError), None);
        assert_eq!(limits.for_category(ErrorCategory::Network), Some(5));
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("syncline.json");
        std::fs::write(&path, r#"{"admin":{"http_addr":"0.0.0.0:1"}}"#).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.admin.http_addr, "0.0.0.0:1");
    }
}
