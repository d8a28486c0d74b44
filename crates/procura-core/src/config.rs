//! Core configuration, loaded from TOML and passed in at construction.
//!
//! No component reads configuration from global state; the deployment
//! loads one [`CoreConfig`] and hands each component its section.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evaluator::{AuthCacheConfig, EvaluatorConfig};
use crate::merkle::AggregatorConfig;
use crate::pipeline::{DEFAULT_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS};
use crate::spending::SpendingCacheConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File read failure.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// The path that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// TOML parse failure.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Consumer tuning shared by all groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerTuning {
    /// Attempts per message before dead-lettering.
    pub max_attempts: u32,

    /// Backoff schedule between attempts, milliseconds.
    pub backoff_ms: Vec<u64>,

    /// Records fetched per poll.
    pub batch_size: usize,

    /// Poll timeout against the external broker, milliseconds.
    pub poll_timeout_ms: u64,
}

impl Default for ConsumerTuning {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS.to_vec(),
            batch_size: 64,
            poll_timeout_ms: 1_000,
        }
    }
}

/// Retention knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Rolling snapshots kept per partition (plus one per month).
    pub snapshots_keep: u32,

    /// Days a dead-lettered message is retained.
    pub dlq_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            snapshots_keep: 7,
            dlq_days: 30,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Path of the `SQLite` store.
    pub store_path: PathBuf,

    /// Directory for partition lock files.
    pub lock_dir: PathBuf,

    /// Directory for principal key files.
    pub keys_dir: PathBuf,

    /// Path of the pricebook TOML.
    pub pricebook_path: Option<PathBuf>,

    /// Number of ledger/bus partitions.
    pub partition_count: i32,

    /// Evaluator deadline settings.
    pub evaluator: EvaluatorConfig,

    /// Evaluator cache bounds.
    pub auth_caches: AuthCacheConfig,

    /// Spending cache bounds.
    pub spending_cache: SpendingCacheConfig,

    /// Merkle batching thresholds.
    pub aggregator: AggregatorConfig,

    /// Consumer retry/polling tuning.
    pub consumers: ConsumerTuning,

    /// Retention policy.
    pub retention: RetentionConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("procura.db"),
            lock_dir: PathBuf::from("locks"),
            keys_dir: PathBuf::from("keys"),
            pricebook_path: None,
            partition_count: 4,
            evaluator: EvaluatorConfig::default(),
            auth_caches: AuthCacheConfig::default(),
            spending_cache: SpendingCacheConfig::default(),
            aggregator: AggregatorConfig::default(),
            consumers: ConsumerTuning::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Parses a config from TOML text; absent keys take their defaults.
    ///
    /// # Errors
    ///
    /// `Parse` on malformed TOML.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads a config file.
    ///
    /// # Errors
    ///
    /// `Io` on read failure, `Parse` on malformed TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.partition_count, 4);
        assert_eq!(config.evaluator.deadline_ms, 100);
        assert_eq!(config.auth_caches.ttl_ms, 60_000);
        assert_eq!(config.aggregator.size_threshold, 1024);
        assert_eq!(config.aggregator.time_threshold_ms, 60_000);
        assert_eq!(config.consumers.max_attempts, 3);
        assert_eq!(config.consumers.backoff_ms, vec![500, 1_000, 2_000]);
        assert_eq!(config.retention.snapshots_keep, 7);
        assert_eq!(config.retention.dlq_days, 30);
    }

    #[test]
    fn partial_toml_overrides_only_named_keys() {
        let config = CoreConfig::from_toml(
            r#"
            store_path = "/var/lib/procura/ledger.db"
            partition_count = 8

            [aggregator]
            size_threshold = 256
            "#,
        )
        .unwrap();
        assert_eq!(config.store_path, PathBuf::from("/var/lib/procura/ledger.db"));
        assert_eq!(config.partition_count, 8);
        assert_eq!(config.aggregator.size_threshold, 256);
        // Unnamed keys keep defaults.
        assert_eq!(config.aggregator.time_threshold_ms, 60_000);
        assert_eq!(config.evaluator.deadline_ms, 100);
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(
            CoreConfig::from_toml("partition_count = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
