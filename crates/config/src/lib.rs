//! Configuration management for viewsync
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `VIEWSYNC_`-prefixed environment variables with `__` separating nested
//! keys (`VIEWSYNC_SOURCE__TOPIC=products`).

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use viewsync_processor::kafka::KafkaSourceConfig;
use viewsync_processor::state::RedisConfig;
use viewsync_processor::{ApplyFailurePolicy, ConsumerConfig, DecodeFailurePolicy};
use viewsync_types::CheckpointScope;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "VIEWSYNC_";

/// Complete configuration of one view process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewSyncConfig {
    /// What is materialized
    pub view: ViewConfig,

    /// Where messages come from
    pub source: SourceConfig,

    /// Where the view and its checkpoint live
    pub store: StoreConfig,

    /// Flush triggers and failure policies
    pub consumer: ConsumerSettings,

    /// Logging
    pub observability: ObservabilityConfig,
}

impl ViewSyncConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        Self::extract(Self::figment(config_path))
    }

    /// Layered providers, exposed so callers can merge extra layers
    pub fn figment(config_path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ViewSyncConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extract and validate a configuration from `figment`
    pub fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.view.name.is_empty() {
            return Err(ConfigError::ValidationError("view.name is required".to_string()));
        }

        match self.view.kind {
            ViewKind::Raw => {}
            ViewKind::CategoryIndex => {
                if self.view.field.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::ValidationError(
                        "view.field is required for category_index views".to_string(),
                    ));
                }
            }
            ViewKind::SearchIndex => {
                if self.view.search_term.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::ValidationError(
                        "view.search_term is required for search_index views".to_string(),
                    ));
                }
                if self.view.search_fields.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "view.search_fields must not be empty for search_index views".to_string(),
                    ));
                }
            }
        }

        if self.source.brokers.trim().is_empty() {
            return Err(ConfigError::ValidationError("source.brokers is required".to_string()));
        }

        if self.source.topic.is_empty() {
            return Err(ConfigError::ValidationError("source.topic is required".to_string()));
        }

        if self.source.partition < 0 {
            return Err(ConfigError::ValidationError(
                "source.partition must not be negative".to_string(),
            ));
        }

        if self.store.parallelism == 0 {
            return Err(ConfigError::ValidationError(
                "store.parallelism must be greater than 0".to_string(),
            ));
        }

        self.consumer_config()?;
        Ok(())
    }

    /// Checkpoint scope of the configured view
    pub fn scope(&self) -> CheckpointScope {
        CheckpointScope::new(
            self.view.name.clone(),
            self.source.topic.clone(),
            self.source.partition,
        )
    }

    /// Consumer tuning
    pub fn consumer_config(&self) -> Result<ConsumerConfig> {
        let c = &self.consumer;

        let apply_failure = match c.apply_failure {
            FailureMode::Fatal => ApplyFailurePolicy::Fatal,
            FailureMode::Retry => ApplyFailurePolicy::Retry {
                max_attempts: c.retry_attempts,
                initial_backoff: Duration::from_millis(c.retry_backoff_ms),
                max_backoff: Duration::from_millis(c.retry_backoff_ms.saturating_mul(16)),
            },
        };

        let decode_failure = match c.decode_failure {
            DecodeMode::Fatal => DecodeFailurePolicy::Fatal,
            DecodeMode::Skip => DecodeFailurePolicy::SkipAndLog,
        };

        let mut config = ConsumerConfig::default()
            .with_flush_interval(Duration::from_millis(c.flush_interval_ms))
            .with_flush_capacity(c.flush_capacity)
            .with_apply_failure(apply_failure)
            .with_decode_failure(decode_failure);

        if let Some(ms) = c.apply_timeout_ms {
            config = config.with_apply_timeout(Duration::from_millis(ms));
        }

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }

    /// Kafka client settings
    pub fn kafka_config(&self) -> KafkaSourceConfig {
        KafkaSourceConfig {
            bootstrap_servers: self
                .source
                .brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(String::from)
                .collect(),
            group_id: self.source.group_id.clone(),
            extra_config: self.source.extra.clone(),
            ..Default::default()
        }
    }

    /// Redis connection settings
    pub fn redis_config(&self) -> Result<RedisConfig> {
        let base = Duration::from_millis(self.store.retry_base_delay_ms);
        RedisConfig::builder()
            .url(self.store.url.clone())
            .key_prefix(self.store.key_prefix.clone())
            .retries(self.store.max_retries, base, base.saturating_mul(32))
            .build()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

/// Kind of view to materialize
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    /// Message values stored verbatim
    #[default]
    Raw,
    /// Keys grouped into sets by one field
    CategoryIndex,
    /// Keys whose text fields mention a term
    SearchIndex,
}

/// View configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// View name, part of the checkpoint scope
    pub name: String,

    /// View kind
    pub kind: ViewKind,

    /// Drop messages older than the last one applied per key
    pub versioned: bool,

    /// Field grouped on by `category_index` views
    pub field: Option<String>,

    /// Term matched by `search_index` views
    pub search_term: Option<String>,

    /// Text fields searched by `search_index` views
    pub search_fields: Vec<String>,

    /// Set key for `search_index` views, or set prefix for
    /// `category_index` views
    pub bucket: Option<String>,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            name: "view".to_string(),
            kind: ViewKind::Raw,
            versioned: true,
            field: None,
            search_term: None,
            search_fields: Vec::new(),
            bucket: None,
        }
    }
}

/// Source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Comma-separated broker list
    pub brokers: String,

    /// Topic to consume
    pub topic: String,

    /// Partition to consume
    pub partition: i32,

    /// Group id reported to the brokers
    pub group_id: String,

    /// Extra librdkafka properties
    pub extra: HashMap<String, String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: String::new(),
            partition: 0,
            group_id: "viewsync".to_string(),
            extra: HashMap::new(),
        }
    }
}

/// View and checkpoint store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis URL
    pub url: String,

    /// Prefix for every key written
    pub key_prefix: String,

    /// Concurrent store round trips allowed
    pub parallelism: u32,

    /// Connection retries
    pub max_retries: u32,

    /// First retry delay in milliseconds
    pub retry_base_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: String::new(),
            parallelism: viewsync_processor::DEFAULT_PARALLELISM,
            max_retries: 3,
            retry_base_delay_ms: 100,
        }
    }
}

/// Apply failure handling
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    #[default]
    Fatal,
    Retry,
}

/// Malformed payload handling
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    #[default]
    Fatal,
    Skip,
}

/// Consumer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Time trigger in milliseconds
    pub flush_interval_ms: u64,

    /// Count trigger
    pub flush_capacity: usize,

    /// Per-attempt apply timeout in milliseconds
    pub apply_timeout_ms: Option<u64>,

    /// Apply failure handling
    pub apply_failure: FailureMode,

    /// Attempts when `apply_failure` is `retry`
    pub retry_attempts: u32,

    /// First retry delay in milliseconds
    pub retry_backoff_ms: u64,

    /// Malformed payload handling
    pub decode_failure: DecodeMode,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: viewsync_processor::DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
            flush_capacity: viewsync_processor::DEFAULT_FLUSH_CAPACITY,
            apply_timeout_ms: None,
            apply_failure: FailureMode::Fatal,
            retry_attempts: 3,
            retry_backoff_ms: 200,
            decode_failure: DecodeMode::Fatal,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,

    /// Enable structured JSON logging
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
