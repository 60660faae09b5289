//! Redis view store
//!
//! Plain keys map to Redis strings and sets map to Redis sets. All calls go
//! through a shared [`ConnectionManager`] with retry and exponential backoff
//! for transient failures.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use viewsync_processor::state::{RedisConfig, RedisViewStore, ViewStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::builder()
//!         .url("redis://localhost:6379")
//!         .key_prefix("products:")
//!         .build()?;
//!
//!     let store = RedisViewStore::new(config).await?;
//!     store.set(b"p-1", b"{\"name\":\"shoe\"}").await?;
//!     store.set_add(b"category:shoes", b"p-1").await?;
//!
//!     let stats = store.stats().await;
//!     println!("writes: {}", stats.write_count);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, trace, warn};

use super::backend::ViewStore;
use crate::error::{StateError, StateResult};

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL
    pub url: String,
    /// Prefix prepended to every key, for namespace isolation
    pub key_prefix: String,
    /// Attempts per operation before giving up
    pub max_retries: u32,
    /// Delay before the first retry
    pub retry_base_delay: Duration,
    /// Upper bound for the retry delay
    pub retry_max_delay: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: String::new(),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Create a new configuration builder
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::default()
    }
}

/// Builder for RedisConfig
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    /// Set Redis URL
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set key prefix for namespace isolation
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Set retry configuration (max attempts, base delay, max delay)
    pub fn retries(mut self, max: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.config.max_retries = max;
        self.config.retry_base_delay = base_delay;
        self.config.retry_max_delay = max_delay;
        self
    }

    /// Build the configuration
    pub fn build(self) -> StateResult<RedisConfig> {
        if self.config.url.is_empty() {
            return Err(StateError::storage("redis", "No Redis URL configured"));
        }

        if self.config.max_retries == 0 {
            return Err(StateError::storage("redis", "max_retries must be at least 1"));
        }

        if self.config.retry_max_delay < self.config.retry_base_delay {
            return Err(StateError::storage(
                "redis",
                "retry_max_delay must be >= retry_base_delay",
            ));
        }

        Ok(self.config)
    }
}

/// Statistics for Redis store operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisStats {
    /// Number of get operations
    pub get_count: u64,
    /// Number of set/delete operations
    pub write_count: u64,
    /// Number of set-add/set-remove operations
    pub member_ops: u64,
    /// Number of retried attempts
    pub retry_count: u64,
    /// Number of failed attempts
    pub error_count: u64,
}

/// Open a connection manager, retrying with backoff
pub(crate) async fn connect(config: &RedisConfig) -> StateResult<ConnectionManager> {
    let client = Client::open(config.url.as_str())
        .map_err(|e| StateError::storage("redis", format!("Failed to create client: {}", e)))?;

    let mut retries = 0;
    let mut delay = config.retry_base_delay;

    loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(conn) => {
                debug!(url = %config.url, "Redis connection established");
                return Ok(conn);
            }
            Err(e) => {
                retries += 1;
                if retries >= config.max_retries {
                    error!("Failed to connect to Redis after {} attempts: {}", retries, e);
                    return Err(StateError::storage(
                        "redis",
                        format!("Connection failed after {} attempts: {}", retries, e),
                    ));
                }

                warn!(
                    "Redis connection attempt {} failed: {}, retrying in {:?}",
                    retries, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, config.retry_max_delay);
            }
        }
    }
}

/// Redis-backed view store
#[derive(Clone)]
pub struct RedisViewStore {
    connection: ConnectionManager,
    config: Arc<RedisConfig>,
    stats: Arc<RwLock<RedisStats>>,
}

impl RedisViewStore {
    /// Connect to Redis
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be established within
    /// `max_retries` attempts.
    pub async fn new(config: RedisConfig) -> StateResult<Self> {
        let connection = connect(&config).await?;
        Ok(Self::with_connection(connection, config))
    }

    /// Build a store over an existing connection
    pub fn with_connection(connection: ConnectionManager, config: RedisConfig) -> Self {
        Self {
            connection,
            config: Arc::new(config),
            stats: Arc::new(RwLock::new(RedisStats::default())),
        }
    }

    /// Shared connection, for other adapters on the same server
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Build full key with prefix
    fn build_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full_key = self.config.key_prefix.as_bytes().to_vec();
        full_key.extend_from_slice(key);
        full_key
    }

    /// Execute operation with retry logic
    async fn with_retry<F, Fut, T>(&self, mut operation: F) -> StateResult<T>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let mut retries = 0;
        let mut delay = self.config.retry_base_delay;

        loop {
            match operation(self.connection.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    retries += 1;

                    {
                        let mut stats = self.stats.write().await;
                        stats.error_count += 1;
                    }

                    if retries >= self.config.max_retries {
                        error!("Operation failed after {} attempts: {}", retries, e);
                        return Err(StateError::storage(
                            "redis",
                            format!("Operation failed after {} attempts: {}", retries, e),
                        ));
                    }

                    self.stats.write().await.retry_count += 1;
                    warn!(
                        "Operation attempt {} failed: {}, retrying in {:?}",
                        retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.config.retry_max_delay);
                }
            }
        }
    }

    /// Get current statistics
    pub async fn stats(&self) -> RedisStats {
        self.stats.read().await.clone()
    }

    /// Ping the server
    pub async fn health_check(&self) -> StateResult<bool> {
        let pong: String = self
            .with_retry(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(pong == "PONG")
    }
}

#[async_trait]
impl ViewStore for RedisViewStore {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        let full_key = self.build_key(key);
        trace!("Getting key: {:?}", full_key);

        let result: Option<Vec<u8>> = self
            .with_retry(|mut conn| {
                let full_key = full_key.clone();
                async move { conn.get(&full_key).await }
            })
            .await?;

        self.stats.write().await.get_count += 1;
        Ok(result)
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        let full_key = self.build_key(key);
        trace!("Setting key: {:?}, value size: {} bytes", full_key, value.len());

        self.with_retry(|mut conn| {
            let full_key = full_key.clone();
            let value = value.to_vec();
            async move { conn.set::<_, _, ()>(&full_key, &value).await }
        })
        .await?;

        self.stats.write().await.write_count += 1;
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        let full_key = self.build_key(key);
        trace!("Deleting key: {:?}", full_key);

        self.with_retry(|mut conn| {
            let full_key = full_key.clone();
            async move { conn.del::<_, ()>(&full_key).await }
        })
        .await?;

        self.stats.write().await.write_count += 1;
        Ok(())
    }

    async fn set_add(&self, set: &[u8], member: &[u8]) -> StateResult<()> {
        let full_key = self.build_key(set);

        self.with_retry(|mut conn| {
            let full_key = full_key.clone();
            let member = member.to_vec();
            async move { conn.sadd::<_, _, ()>(&full_key, &member).await }
        })
        .await?;

        self.stats.write().await.member_ops += 1;
        Ok(())
    }

    async fn set_remove(&self, set: &[u8], member: &[u8]) -> StateResult<()> {
        let full_key = self.build_key(set);

        self.with_retry(|mut conn| {
            let full_key = full_key.clone();
            let member = member.to_vec();
            async move { conn.srem::<_, _, ()>(&full_key, &member).await }
        })
        .await?;

        self.stats.write().await.member_ops += 1;
        Ok(())
    }

    async fn set_members(&self, set: &[u8]) -> StateResult<Vec<Vec<u8>>> {
        let full_key = self.build_key(set);

        self.with_retry(|mut conn| {
            let full_key = full_key.clone();
            async move { conn.smembers(&full_key).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::backend::tests::*;

    // Requires Redis running on localhost
    async fn create_test_store(prefix: &str) -> Option<RedisViewStore> {
        let config = RedisConfig::builder()
            .url("redis://localhost:6379")
            .key_prefix(prefix)
            .retries(1, Duration::from_millis(10), Duration::from_millis(10))
            .build()
            .ok()?;

        RedisViewStore::new(config).await.ok()
    }

    #[test]
    fn test_config_builder_validation() {
        assert!(RedisConfig::builder().url("").build().is_err());
        assert!(RedisConfig::builder()
            .retries(0, Duration::from_millis(1), Duration::from_millis(1))
            .build()
            .is_err());
        assert!(RedisConfig::builder()
            .retries(3, Duration::from_secs(2), Duration::from_secs(1))
            .build()
            .is_err());

        let config = RedisConfig::builder()
            .url("redis://cache:6379")
            .key_prefix("view:")
            .build()
            .unwrap();
        assert_eq!(config.url, "redis://cache:6379");
        assert_eq!(config.key_prefix, "view:");
    }

    #[tokio::test]
    async fn test_redis_store_basic() {
        if let Some(store) = create_test_store("viewsync-test-basic:").await {
            test_store_basic_ops(store).await;
        } else {
            eprintln!("Skipping test: Redis not available");
        }
    }

    #[tokio::test]
    async fn test_redis_store_sets() {
        if let Some(store) = create_test_store("viewsync-test-sets:").await {
            let _ = store.delete(b"category:shoes").await;
            test_store_set_ops(store).await;
        } else {
            eprintln!("Skipping test: Redis not available");
        }
    }
}
