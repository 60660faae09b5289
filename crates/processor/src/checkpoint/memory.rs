//! In-memory checkpoint store

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;
use viewsync_types::CheckpointScope;

use super::CheckpointStore;
use crate::error::{CheckpointError, CheckpointResult, StateError};

/// In-memory checkpoint store
///
/// Keeps every value ever written per scope so tests can assert on the
/// commit sequence, and can be told to fail writes.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    current: DashMap<String, i64>,
    history: DashMap<String, Vec<i64>>,
    fail_writes: AtomicBool,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `offset` for `scope`
    pub fn with_checkpoint(scope: &CheckpointScope, offset: i64) -> Self {
        let store = Self::new();
        store.current.insert(scope.storage_key(), offset);
        store
    }

    /// Current value for `scope`
    pub fn current(&self, scope: &CheckpointScope) -> Option<i64> {
        self.current.get(&scope.storage_key()).map(|v| *v)
    }

    /// Every value written for `scope`, in write order
    pub fn history(&self, scope: &CheckpointScope) -> Vec<i64> {
        self.history
            .get(&scope.storage_key())
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Make subsequent writes fail until reset
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, scope: &CheckpointScope) -> CheckpointResult<Option<i64>> {
        Ok(self.current(scope))
    }

    async fn set(&self, scope: &CheckpointScope, offset: i64) -> CheckpointResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointError::Store {
                scope: scope.to_string(),
                source: StateError::storage("memory", "write rejected"),
            });
        }

        trace!(scope = %scope, offset, "Storing checkpoint");
        let key = scope.storage_key();
        self.current.insert(key.clone(), offset);
        self.history.entry(key).or_default().push(offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let store = InMemoryCheckpointStore::new();
        let a = CheckpointScope::new("product-details", "products", 0);
        let b = CheckpointScope::new("categories", "products", 0);

        store.set(&a, 42).await.unwrap();

        assert_eq!(store.get(&a).await.unwrap(), Some(42));
        assert_eq!(store.get(&b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_with_checkpoint_has_no_history() {
        let scope = CheckpointScope::new("v", "t", 1);
        let store = InMemoryCheckpointStore::with_checkpoint(&scope, 9);

        assert_eq!(store.get(&scope).await.unwrap(), Some(9));
        assert!(store.history(&scope).is_empty());
    }
}
