//! Static, load-once configuration: a nested serde-derived struct tree
//! loaded through the `config` crate. No hot-reload and no REST config
//! surface — config is read once at start-up and held for the process
//! lifetime.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::err::{EleanorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EleanorConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub sqlite: SqliteConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_stream_key")]
    pub events_stream: String,
    #[serde(default = "default_alert_stream_key")]
    pub alerts_stream: String,
    #[serde(default = "default_dlq_suffix")]
    pub dlq_suffix: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_max_delivery")]
    pub max_delivery_attempts: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            events_stream: default_stream_key(),
            alerts_stream: default_alert_stream_key(),
            dlq_suffix: default_dlq_suffix(),
            consumer_group: default_consumer_group(),
            max_delivery_attempts: default_max_delivery(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_stream_key() -> String {
    "eleanor:events".to_string()
}
fn default_alert_stream_key() -> String {
    "eleanor:alerts".to_string()
}
fn default_dlq_suffix() -> String {
    ":dlq".to_string()
}
fn default_consumer_group() -> String {
    "eleanor-workers".to_string()
}
fn default_max_delivery() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    #[serde(default = "default_sqlite_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> String {
    "eleanor_state.db".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorsConfig {
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,
    #[serde(default = "default_min_idle_ms")]
    pub min_idle_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            recovery_interval_secs: default_recovery_interval_secs(),
            min_idle_ms: default_min_idle_ms(),
        }
    }
}

fn default_worker_count() -> usize {
    num_cpus::get().max(1)
}
fn default_batch_size() -> usize {
    100
}
fn default_block_ms() -> u64 {
    1000
}
fn default_cleanup_interval_secs() -> u64 {
    60
}
fn default_recovery_interval_secs() -> u64 {
    30
}
fn default_min_idle_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    #[serde(default = "default_evidence_dir")]
    pub storage_dir: String,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_evidence_dir(),
        }
    }
}

fn default_evidence_dir() -> String {
    "evidence_store".to_string()
}

impl Default for EleanorConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            sqlite: SqliteConfig::default(),
            connectors: ConnectorsConfig::default(),
            processor: ProcessorConfig::default(),
            evidence: EvidenceConfig::default(),
        }
    }
}

impl EleanorConfig {
    /// Loads configuration once at start-up from an optional TOML file,
    /// layered over environment variables prefixed `ELEANOR_` (e.g.
    /// `ELEANOR_REDIS__URL`), falling back to defaults for anything unset.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&EleanorConfig::default()).map_err(|e| EleanorError::config(e))?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ELEANOR")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .map_err(|e| EleanorError::config(e))?
            .try_deserialize()
            .map_err(|e| EleanorError::config(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let cfg = EleanorConfig::default();
        assert_eq!(cfg.processor.batch_size, 100);
        assert_eq!(cfg.redis.max_delivery_attempts, 5);
    }
}
