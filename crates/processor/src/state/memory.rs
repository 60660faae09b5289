//! In-memory view store
//!
//! Backed by DashMap for concurrent access from many apply tasks. Used by
//! tests, embedders, and anyone who wants a view that does not outlive the
//! process.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::backend::ViewStore;
use crate::error::StateResult;

/// Statistics about the memory view store
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreStats {
    /// Number of plain keys
    pub total_entries: usize,
    /// Number of non-empty sets
    pub total_sets: usize,
    /// Number of get operations
    pub get_count: u64,
    /// Number of set/delete operations
    pub write_count: u64,
    /// Number of set-add/set-remove operations
    pub member_ops: u64,
}

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    writes: AtomicU64,
    member_ops: AtomicU64,
}

/// In-memory view store using DashMap
///
/// Cloning is cheap and every clone shares the same data.
///
/// ```rust
/// use viewsync_processor::state::{MemoryViewStore, ViewStore};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryViewStore::new();
/// store.set(b"product:1", b"{}").await?;
/// store.set_add(b"category:shoes", b"product:1").await?;
///
/// assert_eq!(store.members_utf8("category:shoes"), vec!["product:1".to_string()]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryViewStore {
    values: Arc<DashMap<Vec<u8>, Vec<u8>>>,
    sets: Arc<DashMap<Vec<u8>, DashSet<Vec<u8>>>>,
    counters: Arc<Counters>,
}

impl MemoryViewStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the store statistics
    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            total_entries: self.values.len(),
            total_sets: self.sets.iter().filter(|s| !s.value().is_empty()).count(),
            get_count: self.counters.gets.load(Ordering::Relaxed),
            write_count: self.counters.writes.load(Ordering::Relaxed),
            member_ops: self.counters.member_ops.load(Ordering::Relaxed),
        }
    }

    /// Value under `key` as UTF-8, for assertions and debugging
    pub fn value_utf8(&self, key: &str) -> Option<String> {
        self.values
            .get(key.as_bytes())
            .map(|v| String::from_utf8_lossy(v.value()).into_owned())
    }

    /// Sorted members of `set` as UTF-8
    pub fn members_utf8(&self, set: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .sets
            .get(set.as_bytes())
            .map(|s| {
                s.iter()
                    .map(|m| String::from_utf8_lossy(m.key()).into_owned())
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Sorted plain keys, as UTF-8
    pub fn keys_utf8(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .iter()
            .map(|e| String::from_utf8_lossy(e.key()).into_owned())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ViewStore for MemoryViewStore {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        trace!("Getting key: {:?}", key);
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        trace!("Setting key: {:?}, value size: {} bytes", key, value.len());
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.values.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        trace!("Deleting key: {:?}", key);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.values.remove(key);
        Ok(())
    }

    async fn set_add(&self, set: &[u8], member: &[u8]) -> StateResult<()> {
        self.counters.member_ops.fetch_add(1, Ordering::Relaxed);
        self.sets
            .entry(set.to_vec())
            .or_default()
            .insert(member.to_vec());
        Ok(())
    }

    async fn set_remove(&self, set: &[u8], member: &[u8]) -> StateResult<()> {
        self.counters.member_ops.fetch_add(1, Ordering::Relaxed);
        if let Some(members) = self.sets.get(set) {
            members.remove(member);
        }
        // Redis drops empty sets; mirror that
        self.sets.remove_if(set, |_, members| members.is_empty());
        Ok(())
    }

    async fn set_members(&self, set: &[u8]) -> StateResult<Vec<Vec<u8>>> {
        Ok(self
            .sets
            .get(set)
            .map(|s| s.iter().map(|m| m.key().clone()).collect())
            .unwrap_or_default())
    }
}
