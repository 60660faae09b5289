//! Weighted admission control toward the shared store
//!
//! Apply tasks are dispatched without bound, but the connection pool behind
//! the view store is not. An [`AdmissionLimiter`] caps how many store
//! operations run at once regardless of how many apply tasks exist.
//!
//! Ordinary operations take weight 1. A checkpoint write takes the full
//! capacity, so it runs alone on the pool.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;
use viewsync_types::CheckpointScope;

use crate::checkpoint::CheckpointStore;
use crate::error::{CheckpointError, CheckpointResult, StateError, StateResult};
use crate::state::ViewStore;

/// Default number of concurrent store operations
pub const DEFAULT_PARALLELISM: u32 = 64;

/// Weighted semaphore with a fixed capacity
#[derive(Debug, Clone)]
pub struct AdmissionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

impl AdmissionLimiter {
    /// Create a limiter admitting `capacity` units at once
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    /// Total capacity
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Units currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for `weight` units
    ///
    /// Weights above the capacity are clamped to it, so an oversized request
    /// waits for exclusivity instead of blocking forever.
    pub async fn acquire(&self, weight: u32) -> StateResult<OwnedSemaphorePermit> {
        let weight = weight.clamp(1, self.capacity);
        trace!(weight, available = self.available(), "Waiting for admission");
        self.semaphore
            .clone()
            .acquire_many_owned(weight)
            .await
            .map_err(|_| StateError::AdmissionClosed)
    }

    /// Wait until no other operation holds the limiter
    pub async fn acquire_exclusive(&self) -> StateResult<OwnedSemaphorePermit> {
        self.acquire(self.capacity).await
    }
}

impl Default for AdmissionLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLELISM)
    }
}

/// Store decorator that runs every call behind an [`AdmissionLimiter`]
///
/// Wrapping both the view store and the checkpoint store with the same
/// limiter puts them on one budget.
#[derive(Clone)]
pub struct Admitted<S> {
    inner: S,
    limiter: AdmissionLimiter,
}

impl<S> Admitted<S> {
    /// Wrap `inner`
    pub fn new(inner: S, limiter: AdmissionLimiter) -> Self {
        Self { inner, limiter }
    }

    /// Limiter shared by this wrapper
    pub fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    /// Wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ViewStore> ViewStore for Admitted<S> {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        let _permit = self.limiter.acquire(1).await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        let _permit = self.limiter.acquire(1).await?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        let _permit = self.limiter.acquire(1).await?;
        self.inner.delete(key).await
    }

    async fn set_add(&self, set: &[u8], member: &[u8]) -> StateResult<()> {
        let _permit = self.limiter.acquire(1).await?;
        self.inner.set_add(set, member).await
    }

    async fn set_remove(&self, set: &[u8], member: &[u8]) -> StateResult<()> {
        let _permit = self.limiter.acquire(1).await?;
        self.inner.set_remove(set, member).await
    }

    async fn set_members(&self, set: &[u8]) -> StateResult<Vec<Vec<u8>>> {
        let _permit = self.limiter.acquire(1).await?;
        self.inner.set_members(set).await
    }
}

#[async_trait]
impl<S: CheckpointStore> CheckpointStore for Admitted<S> {
    async fn get(&self, scope: &CheckpointScope) -> CheckpointResult<Option<i64>> {
        let _permit = self
            .limiter
            .acquire(1)
            .await
            .map_err(|source| admission_error(scope, source))?;
        self.inner.get(scope).await
    }

    async fn set(&self, scope: &CheckpointScope, offset: i64) -> CheckpointResult<()> {
        let _permit = self
            .limiter
            .acquire_exclusive()
            .await
            .map_err(|source| admission_error(scope, source))?;
        self.inner.set(scope, offset).await
    }
}

fn admission_error(scope: &CheckpointScope, source: StateError) -> CheckpointError {
    CheckpointError::Store {
        scope: scope.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::state::MemoryViewStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// View store that records its peak concurrency
    #[derive(Default)]
    struct SlowStore {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ViewStore for SlowStore {
        async fn get(&self, _key: &[u8]) -> StateResult<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn set(&self, _key: &[u8], _value: &[u8]) -> StateResult<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, _key: &[u8]) -> StateResult<()> {
            Ok(())
        }

        async fn set_add(&self, _set: &[u8], _member: &[u8]) -> StateResult<()> {
            Ok(())
        }

        async fn set_remove(&self, _set: &[u8], _member: &[u8]) -> StateResult<()> {
            Ok(())
        }

        async fn set_members(&self, _set: &[u8]) -> StateResult<Vec<Vec<u8>>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        assert_eq!(AdmissionLimiter::new(0).capacity(), 1);
        assert_eq!(AdmissionLimiter::default().capacity(), DEFAULT_PARALLELISM);
    }

    #[tokio::test]
    async fn test_oversized_weight_is_clamped() {
        let limiter = AdmissionLimiter::new(4);
        let permit = limiter.acquire(100).await.unwrap();
        assert_eq!(limiter.available(), 0);
        drop(permit);
        assert_eq!(limiter.available(), 4);
    }

    #[tokio::test]
    async fn test_store_concurrency_is_capped() {
        let inner = Arc::new(SlowStore::default());
        let store = Arc::new(Admitted::new(inner.clone(), AdmissionLimiter::new(3)));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20u32 {
            let store = store.clone();
            tasks.spawn(async move { store.set(&i.to_be_bytes(), b"v").await });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap().unwrap();
        }

        assert!(inner.peak.load(Ordering::SeqCst) <= 3);
        assert!(inner.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_checkpoint_write_waits_for_view_operations() {
        let limiter = AdmissionLimiter::new(2);
        let checkpoints = Admitted::new(InMemoryCheckpointStore::new(), limiter.clone());
        let view = Admitted::new(MemoryViewStore::new(), limiter.clone());
        let scope = CheckpointScope::new("v", "t", 0);

        let held = limiter.acquire(1).await.unwrap();

        // a read only needs one unit
        assert_eq!(checkpoints.get(&scope).await.unwrap(), None);
        view.set(b"k", b"v").await.unwrap();

        // a write needs all of them
        let write = checkpoints.set(&scope, 7);
        tokio::pin!(write);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut write)
                .await
                .is_err()
        );

        drop(held);
        write.await.unwrap();
        assert_eq!(checkpoints.inner().current(&scope), Some(7));
    }
}
