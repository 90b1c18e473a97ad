// src/config.rs

//! Host-supplied configuration, usually read from a TOML file.
//!
//! Every field has a default, so an empty file (or `TransferConfig::default()`)
//! is a working setup.

use crate::adapter::ReportPolicy;
use crate::http::HttpOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// What happens to a record once its transfer is terminal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Removed from the store after the final update is broadcast.
    #[default]
    Delete,
    /// Kept for `get_transfers` until the identifier is queued again.
    Keep,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferConfig {
    /// SQLite file backing the record store.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Used for requests that do not say whether metered networks are allowed.
    #[serde(default = "default_true")]
    pub allow_metered_by_default: bool,

    #[serde(default = "default_report_min_interval_ms")]
    pub report_min_interval_ms: u64,

    #[serde(default = "default_report_max_interval_ms")]
    pub report_max_interval_ms: u64,

    /// Transient network failures retried before a transfer errors out.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: usize,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long a cancel waits for the adapter before forcing Canceled.
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,

    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Per-subscriber update buffer; slow subscribers lose the oldest updates.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Terminal results remembered for late `watch_transfer` subscribers.
    /// Must be at least 1. Under `Delete` retention an evicted result is not
    /// delivered to a late subscriber; under `Keep` the stored record is used.
    #[serde(default = "default_finished_history")]
    pub finished_history: usize,

    /// Time allowed to establish a connection. Transfers themselves have no
    /// overall time limit.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Window over which throughput is averaged.
    #[serde(default = "default_throughput_window_ms")]
    pub throughput_window_ms: u64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("transfers.db")
}

fn default_true() -> bool {
    true
}

fn default_report_min_interval_ms() -> u64 {
    250
}

fn default_report_max_interval_ms() -> u64 {
    5_000
}

fn default_retry_budget() -> usize {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_cancel_timeout_ms() -> u64 {
    5_000
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_finished_history() -> usize {
    128
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("http-transfers/", env!("CARGO_PKG_VERSION")).into()
}

fn default_throughput_window_ms() -> u64 {
    5_000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            allow_metered_by_default: default_true(),
            report_min_interval_ms: default_report_min_interval_ms(),
            report_max_interval_ms: default_report_max_interval_ms(),
            retry_budget: default_retry_budget(),
            retry_backoff_ms: default_retry_backoff_ms(),
            cancel_timeout_ms: default_cancel_timeout_ms(),
            retention: RetentionPolicy::default(),
            broadcast_capacity: default_broadcast_capacity(),
            finished_history: default_finished_history(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            throughput_window_ms: default_throughput_window_ms(),
        }
    }
}

impl TransferConfig {
    /// Reads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TransferConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.report_min_interval_ms == 0 {
            return Err(ConfigError::Invalid("report_min_interval_ms must be positive".into()));
        }
        if self.report_max_interval_ms < self.report_min_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "report_max_interval_ms ({}) is below report_min_interval_ms ({})",
                self.report_max_interval_ms, self.report_min_interval_ms
            )));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("broadcast_capacity must be positive".into()));
        }
        if self.finished_history == 0 {
            return Err(ConfigError::Invalid("finished_history must be positive".into()));
        }
        if self.throughput_window_ms == 0 {
            return Err(ConfigError::Invalid("throughput_window_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn report_policy(&self) -> ReportPolicy {
        ReportPolicy::new(
            Duration::from_millis(self.report_min_interval_ms),
            Duration::from_millis(self.report_max_interval_ms),
        )
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_millis(self.throughput_window_ms)
    }

    /// Options for the streaming adapter derived from this config.
    pub fn http_options(&self) -> HttpOptions {
        HttpOptions {
            retry_budget: self.retry_budget,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            user_agent: self.user_agent.clone(),
            report: self.report_policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TransferConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.allow_metered_by_default);
        assert_eq!(config.retention, RetentionPolicy::Delete);
        assert_eq!(config.report_policy(), ReportPolicy::default());
        assert_eq!(config.cancel_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn empty_toml_is_the_default() {
        let config = TransferConfig::from_toml_str("").unwrap();
        assert_eq!(config, TransferConfig::default());
    }

    #[test]
    fn partial_toml() {
        let toml_str = r#"
            database_path = "/var/lib/app/transfers.db"
            allow_metered_by_default = false
            retention = "keep"
            retry_budget = 5
        "#;
        let config = TransferConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/app/transfers.db"));
        assert!(!config.allow_metered_by_default);
        assert_eq!(config.retention, RetentionPolicy::Keep);
        assert_eq!(config.http_options().retry_budget, 5);
        assert_eq!(config.report_min_interval_ms, 250);
    }

    #[test]
    fn rejects_inverted_report_bounds() {
        let err = TransferConfig::from_toml_str("report_min_interval_ms = 1000\nreport_max_interval_ms = 10").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_empty_finished_history() {
        let err = TransferConfig::from_toml_str("finished_history = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("finished_history")));
    }

    #[test]
    fn connect_timeout_feeds_the_http_options() {
        let config = TransferConfig::from_toml_str("connect_timeout_secs = 7").unwrap();
        assert_eq!(config.http_options().connect_timeout, Duration::from_secs(7));
        assert_eq!(TransferConfig::default().connect_timeout_secs, 30);
    }

    #[test]
    fn rejects_unknown_retention() {
        let err = TransferConfig::from_toml_str(r#"retention = "forever""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transfers.toml");
        std::fs::write(&path, "cancel_timeout_ms = 750\n").unwrap();

        let config = TransferConfig::load(&path).unwrap();
        assert_eq!(config.cancel_timeout(), Duration::from_millis(750));

        let missing = TransferConfig::load(&tmp.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
