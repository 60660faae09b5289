//! Checkpoint persistence
//!
//! A checkpoint is a single integer per [`CheckpointScope`]: the highest
//! offset whose application, together with every lower offset, is known to
//! have completed. The store itself only offers get/set; monotonicity is
//! enforced on the caller side by [`CheckpointGuard`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use viewsync_processor::checkpoint::{CheckpointGuard, InMemoryCheckpointStore};
//! use viewsync_types::CheckpointScope;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryCheckpointStore::new());
//! let guard = CheckpointGuard::new(store.clone(), CheckpointScope::new("products", "products", 0));
//!
//! assert_eq!(guard.load().await?, None);
//! guard.commit(120).await?;
//! assert!(guard.commit(80).await.is_err());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use viewsync_types::CheckpointScope;

use crate::error::{CheckpointError, CheckpointResult};

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryCheckpointStore;
pub use redis_store::RedisCheckpointStore;

/// Narrow integer get/set contract of a checkpoint store
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last persisted checkpoint for `scope`, `None` on first run
    async fn get(&self, scope: &CheckpointScope) -> CheckpointResult<Option<i64>>;

    /// Persist `offset` as the checkpoint for `scope`
    async fn set(&self, scope: &CheckpointScope, offset: i64) -> CheckpointResult<()>;
}

#[async_trait]
impl<S: CheckpointStore + ?Sized> CheckpointStore for Arc<S> {
    async fn get(&self, scope: &CheckpointScope) -> CheckpointResult<Option<i64>> {
        (**self).get(scope).await
    }

    async fn set(&self, scope: &CheckpointScope, offset: i64) -> CheckpointResult<()> {
        (**self).set(scope, offset).await
    }
}

/// Caller-side monotonic checkpoint writer for one scope
///
/// Remembers the highest value it has loaded or committed and refuses to
/// write anything lower. Commits are serialized, so two writers sharing a
/// guard can never interleave a lower write after a higher one. Writing the
/// same value again is allowed.
pub struct CheckpointGuard {
    store: Arc<dyn CheckpointStore>,
    scope: CheckpointScope,
    committed: Mutex<Option<i64>>,
}

impl CheckpointGuard {
    /// Create a guard for `scope`
    pub fn new(store: Arc<dyn CheckpointStore>, scope: CheckpointScope) -> Self {
        Self {
            store,
            scope,
            committed: Mutex::new(None),
        }
    }

    /// Scope this guard writes
    pub fn scope(&self) -> &CheckpointScope {
        &self.scope
    }

    /// Read the persisted checkpoint and remember it as the floor
    pub async fn load(&self) -> CheckpointResult<Option<i64>> {
        let mut committed = self.committed.lock().await;
        let stored = self.store.get(&self.scope).await?;
        *committed = match (*committed, stored) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        debug!(scope = %self.scope, checkpoint = ?stored, "Loaded checkpoint");
        Ok(stored)
    }

    /// Persist `offset` unless it would move the checkpoint backwards
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Regression`] without writing if `offset` is
    /// lower than the last known checkpoint, or the store error if the write
    /// failed. A failed write leaves the floor unchanged.
    pub async fn commit(&self, offset: i64) -> CheckpointResult<()> {
        let mut committed = self.committed.lock().await;

        if let Some(current) = *committed {
            if offset < current {
                return Err(CheckpointError::Regression {
                    scope: self.scope.to_string(),
                    attempted: offset,
                    committed: current,
                });
            }
        }

        self.store.set(&self.scope, offset).await?;
        *committed = Some(offset);

        info!(scope = %self.scope, offset, "Committed checkpoint");
        Ok(())
    }

    /// Last value loaded or committed through this guard
    pub async fn last_committed(&self) -> Option<i64> {
        *self.committed.lock().await
    }
}
