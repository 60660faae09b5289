//! Redis checkpoint store
//!
//! Checkpoints are stored as plain integers under
//! `{prefix}checkpoint:{view}:{topic}:{partition}`. Writes go through a Lua
//! script that refuses to lower the stored value, so even two processes
//! wrongly sharing a scope cannot move a checkpoint backwards.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use tracing::trace;
use viewsync_types::CheckpointScope;

use super::CheckpointStore;
use crate::error::{CheckpointError, CheckpointResult, StateError};
use crate::state::redis_backend::{connect, RedisConfig};

const SET_UNLESS_LOWER: &str = r"
local current = redis.call('GET', KEYS[1])
if current and tonumber(current) > tonumber(ARGV[1]) then
    return tonumber(current)
end
redis.call('SET', KEYS[1], ARGV[1])
return false
";

/// Redis-backed checkpoint store
#[derive(Clone)]
pub struct RedisCheckpointStore {
    connection: ConnectionManager,
    key_prefix: String,
    set_unless_lower: Script,
}

impl RedisCheckpointStore {
    /// Connect to Redis
    pub async fn new(config: RedisConfig) -> CheckpointResult<Self> {
        let connection = connect(&config)
            .await
            .map_err(|source| CheckpointError::Store {
                scope: "*".to_string(),
                source,
            })?;
        Ok(Self::with_connection(connection, config.key_prefix))
    }

    /// Build a store over an existing connection
    pub fn with_connection(connection: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.into(),
            set_unless_lower: Script::new(SET_UNLESS_LOWER),
        }
    }

    fn key(&self, scope: &CheckpointScope) -> String {
        format!("{}{}", self.key_prefix, scope.storage_key())
    }
}

fn store_error(scope: &CheckpointScope, e: redis::RedisError) -> CheckpointError {
    CheckpointError::Store {
        scope: scope.to_string(),
        source: StateError::storage("redis", e.to_string()),
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get(&self, scope: &CheckpointScope) -> CheckpointResult<Option<i64>> {
        let mut conn = self.connection.clone();
        conn.get(self.key(scope))
            .await
            .map_err(|e| store_error(scope, e))
    }

    async fn set(&self, scope: &CheckpointScope, offset: i64) -> CheckpointResult<()> {
        let key = self.key(scope);
        trace!(key = %key, offset, "Storing checkpoint");

        let mut conn = self.connection.clone();
        let rejected: Option<i64> = self
            .set_unless_lower
            .key(&key)
            .arg(offset)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error(scope, e))?;

        match rejected {
            Some(committed) => Err(CheckpointError::Regression {
                scope: scope.to_string(),
                attempted: offset,
                committed,
            }),
            None => Ok(()),
        }
    }
}
