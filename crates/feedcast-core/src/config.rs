//! Configuration system for feedcast.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FEEDCAST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/feedcast/config.toml
//!   3. ~/.config/feedcast/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedcastConfig {
    pub api: ApiConfig,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
    pub port: u16,
    /// How long a request may wait for a computation before giving up.
    pub task_timeout_secs: u64,
    /// Lower bound for caller-requested cache lifetimes.
    pub min_lifetime_secs: u64,
    /// Upper bound for caller-requested cache lifetimes.
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Queue subjects are `{subject_prefix}.{fingerprint}`.
    pub subject_prefix: String,
    /// Key/value bucket holding rendered results.
    pub cache_bucket: String,
    /// Durable consumer name shared by all workers.
    pub durable_name: String,
    /// Window in which a second publish with the same fingerprint is dropped.
    /// Must cover the slowest expected computation.
    pub dedup_window_secs: u64,
    /// Redelivery timeout for an unacknowledged delivery.
    pub ack_wait_secs: u64,
    /// Deliveries per item before it is dropped. 0 = unlimited.
    pub max_deliver: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Parallel consumers in this process. 0 = available parallelism.
    pub concurrency: u32,
    /// Extractor program. Receives the task envelope on stdin and writes the
    /// result payload to stdout.
    pub command: String,
    pub args: Vec<String>,
    pub exec_timeout_secs: u64,
    /// Delay before a retryable failure is redelivered.
    pub retry_delay_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 5000,
            task_timeout_secs: 20,
            min_lifetime_secs: 20,
            max_lifetime_secs: 24 * 60 * 60,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "render_tasks".to_string(),
            cache_bucket: "render_cache".to_string(),
            durable_name: "worker".to_string(),
            dedup_window_secs: 120,
            ack_wait_secs: 30,
            max_deliver: 5,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            command: "feedcast-extractor".to_string(),
            args: Vec::new(),
            exec_timeout_secs: 60,
            retry_delay_secs: 10,
        }
    }
}

impl ApiConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn min_lifetime(&self) -> Duration {
        Duration::from_secs(self.min_lifetime_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

impl BrokerConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

impl WorkerConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Resolved worker count.
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.concurrency as usize
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("feedcast")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FeedcastConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a config file, falling back to defaults if it does not exist.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(FeedcastConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FEEDCAST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&FeedcastConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply FEEDCAST_* overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.parse().ok())
        }

        if let Some(v) = lookup("FEEDCAST_API__LISTEN_ADDR") {
            self.api.listen_addr = v;
        }
        if let Some(v) = parsed(&lookup, "FEEDCAST_API__PORT") {
            self.api.port = v;
        }
        if let Some(v) = parsed(&lookup, "FEEDCAST_API__TASK_TIMEOUT_SECS") {
            self.api.task_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "FEEDCAST_API__MIN_LIFETIME_SECS") {
            self.api.min_lifetime_secs = v;
        }
        if let Some(v) = parsed(&lookup, "FEEDCAST_API__MAX_LIFETIME_SECS") {
            self.api.max_lifetime_secs = v;
        }
        if let Some(v) = lookup("FEEDCAST_BROKER__SUBJECT_PREFIX") {
            self.broker.subject_prefix = v;
        }
        if let Some(v) = lookup("FEEDCAST_BROKER__CACHE_BUCKET") {
            self.broker.cache_bucket = v;
        }
        if let Some(v) = lookup("FEEDCAST_BROKER__DURABLE_NAME") {
            self.broker.durable_name = v;
        }
        if let Some(v) = parsed(&lookup, "FEEDCAST_BROKER__DEDUP_WINDOW_SECS") {
            self.broker.dedup_window_secs = v;
        }
        if let Some(v) = parsed(&lookup, "FEEDCAST_BROKER__ACK_WAIT_SECS") {
            self.broker.ack_wait_secs = v;
        }
        if let Some(v) = parsed(&lookup, "FEEDCAST_BROKER__MAX_DELIVER") {
            self.broker.max_deliver = v;
        }
        if let Some(v) = parsed(&lookup, "FEEDCAST_WORKER__CONCURRENCY") {
            self.worker.concurrency = v;
        }
        if let Some(v) = lookup("FEEDCAST_WORKER__COMMAND") {
            self.worker.command = v;
        }
        // Whitespace-separated.
        if let Some(v) = lookup("FEEDCAST_WORKER__ARGS") {
            self.worker.args = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = parsed(&lookup, "FEEDCAST_WORKER__EXEC_TIMEOUT_SECS") {
            self.worker.exec_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "FEEDCAST_WORKER__RETRY_DELAY_SECS") {
            self.worker.retry_delay_secs = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.dedup_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "broker.dedup_window_secs must be > 0".to_string(),
            ));
        }
        if self.broker.ack_wait_secs == 0 {
            return Err(ConfigError::Invalid(
                "broker.ack_wait_secs must be > 0".to_string(),
            ));
        }
        if self.broker.subject_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "broker.subject_prefix is empty".to_string(),
            ));
        }
        if self.api.min_lifetime_secs > self.api.max_lifetime_secs {
            return Err(ConfigError::Invalid(format!(
                "api.min_lifetime_secs ({}) > api.max_lifetime_secs ({})",
                self.api.min_lifetime_secs, self.api.max_lifetime_secs
            )));
        }
        if self.api.task_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "api.task_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
