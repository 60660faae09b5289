//! Offset-versioned materializer decorator
//!
//! Apply tasks complete out of offset order. Without a guard, two updates to
//! the same key can finish in the wrong order and leave the older one in the
//! view. [`Versioned`] records the offset of the last message applied for
//! each key and drops any message older than that.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use viewsync_types::Message;

use super::Materializer;
use crate::error::{ApplyError, ApplyResult, StateError};
use crate::state::ViewStore;

/// Drops messages older than the last one applied for the same key
///
/// Applies to one key are serialized by an in-process lock; the version
/// stamp `version:{view}:{key}` is written after the inner apply succeeds.
/// A message whose offset equals the stamp is applied again, so a replay
/// after a crash between the apply and the stamp write converges.
pub struct Versioned<M, S> {
    inner: M,
    store: S,
    stamp_prefix: Vec<u8>,
    locks: DashMap<Vec<u8>, Arc<Mutex<()>>>,
}

impl<M: Materializer, S: ViewStore> Versioned<M, S> {
    /// Guard `inner`, keeping stamps for view `view` in `store`
    pub fn new(view: &str, inner: M, store: S) -> Self {
        Self {
            inner,
            store,
            stamp_prefix: format!("version:{}:", view).into_bytes(),
            locks: DashMap::new(),
        }
    }

    /// Keys currently holding a lock entry
    pub fn tracked_keys(&self) -> usize {
        self.locks.len()
    }

    fn stamp_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = self.stamp_prefix.clone();
        full.extend_from_slice(key);
        full
    }

    async fn stamp(&self, stamp_key: &[u8]) -> ApplyResult<Option<i64>> {
        let Some(raw) = self.store.get(stamp_key).await? else {
            return Ok(None);
        };

        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Some)
            .ok_or_else(|| {
                ApplyError::State(StateError::DeserializationFailed {
                    key: String::from_utf8_lossy(stamp_key).into_owned(),
                    reason: "version stamp is not an integer".to_string(),
                })
            })
    }

    async fn apply_locked(&self, message: &Message) -> ApplyResult<()> {
        let stamp_key = self.stamp_key(&message.key);

        if let Some(applied) = self.stamp(&stamp_key).await? {
            if message.offset < applied {
                debug!(
                    offset = message.offset,
                    applied,
                    key = %message.key_lossy(),
                    "Skipping message older than applied version"
                );
                return Ok(());
            }
        }

        self.inner.apply(message).await?;
        self.store
            .set(&stamp_key, message.offset.to_string().as_bytes())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<M: Materializer, S: ViewStore> Materializer for Versioned<M, S> {
    async fn apply(&self, message: &Message) -> ApplyResult<()> {
        let lock = self
            .locks
            .entry(message.key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(message).await
        };

        drop(lock);
        self.locks
            .remove_if(&message.key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }
}
