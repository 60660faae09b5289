//! View store trait definition
//!
//! A view store is the external key-value/set store a materializer writes
//! into. The consumer never touches it directly; only materializers do.

use async_trait::async_trait;

use crate::error::StateResult;

/// Key-value and set operations a materializer may issue
///
/// Every call is individually fallible. Implementations must be safe to call
/// from many apply tasks at once.
///
/// ## Example Implementation
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use viewsync_processor::error::StateResult;
/// use viewsync_processor::state::ViewStore;
/// use std::collections::{HashMap, HashSet};
/// use tokio::sync::RwLock;
///
/// #[derive(Default)]
/// struct SimpleStore {
///     values: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
///     sets: RwLock<HashMap<Vec<u8>, HashSet<Vec<u8>>>>,
/// }
///
/// #[async_trait]
/// impl ViewStore for SimpleStore {
///     async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
///         Ok(self.values.read().await.get(key).cloned())
///     }
///
///     async fn set(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
///         self.values.write().await.insert(key.to_vec(), value.to_vec());
///         Ok(())
///     }
///
///     async fn delete(&self, key: &[u8]) -> StateResult<()> {
///         self.values.write().await.remove(key);
///         Ok(())
///     }
///
///     async fn set_add(&self, set: &[u8], member: &[u8]) -> StateResult<()> {
///         self.sets.write().await.entry(set.to_vec()).or_default().insert(member.to_vec());
///         Ok(())
///     }
///
///     async fn set_remove(&self, set: &[u8], member: &[u8]) -> StateResult<()> {
///         if let Some(members) = self.sets.write().await.get_mut(set) {
///             members.remove(member);
///         }
///         Ok(())
///     }
///
///     async fn set_members(&self, set: &[u8]) -> StateResult<Vec<Vec<u8>>> {
///         Ok(self.sets.read().await.get(set).map(|m| m.iter().cloned().collect()).unwrap_or_default())
///     }
/// }
/// ```
#[async_trait]
pub trait ViewStore: Send + Sync {
    /// Retrieve the value stored under `key`
    ///
    /// Returns `Ok(None)` if the key does not exist.
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, overwriting any previous value
    async fn set(&self, key: &[u8], value: &[u8]) -> StateResult<()>;

    /// Delete `key`
    ///
    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &[u8]) -> StateResult<()>;

    /// Add `member` to the set stored under `set`
    async fn set_add(&self, set: &[u8], member: &[u8]) -> StateResult<()>;

    /// Remove `member` from the set stored under `set`
    ///
    /// Removing an absent member succeeds.
    async fn set_remove(&self, set: &[u8], member: &[u8]) -> StateResult<()>;

    /// All members of the set stored under `set`, in no particular order
    async fn set_members(&self, set: &[u8]) -> StateResult<Vec<Vec<u8>>>;

    /// Check if a key exists
    async fn contains(&self, key: &[u8]) -> StateResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

#[async_trait]
impl<S: ViewStore + ?Sized> ViewStore for std::sync::Arc<S> {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        (**self).delete(key).await
    }

    async fn set_add(&self, set: &[u8], member: &[u8]) -> StateResult<()> {
        (**self).set_add(set, member).await
    }

    async fn set_remove(&self, set: &[u8], member: &[u8]) -> StateResult<()> {
        (**self).set_remove(set, member).await
    }

    async fn set_members(&self, set: &[u8]) -> StateResult<Vec<Vec<u8>>> {
        (**self).set_members(set).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Shared conformance checks run against every view store
    pub async fn test_store_basic_ops<S: ViewStore>(store: S) {
        assert!(store.get(b"product:1").await.unwrap().is_none());

        store.set(b"product:1", b"blue shoes").await.unwrap();
        assert_eq!(
            store.get(b"product:1").await.unwrap(),
            Some(b"blue shoes".to_vec())
        );
        assert!(store.contains(b"product:1").await.unwrap());

        store.set(b"product:1", b"red shoes").await.unwrap();
        assert_eq!(
            store.get(b"product:1").await.unwrap(),
            Some(b"red shoes".to_vec())
        );

        store.delete(b"product:1").await.unwrap();
        assert!(store.get(b"product:1").await.unwrap().is_none());

        // deleting again is not an error
        store.delete(b"product:1").await.unwrap();
    }

    pub async fn test_store_set_ops<S: ViewStore>(store: S) {
        store.set_add(b"category:shoes", b"p-1").await.unwrap();
        store.set_add(b"category:shoes", b"p-2").await.unwrap();
        store.set_add(b"category:shoes", b"p-2").await.unwrap();

        let mut members = store.set_members(b"category:shoes").await.unwrap();
        members.sort();
        assert_eq!(members, vec![b"p-1".to_vec(), b"p-2".to_vec()]);

        store.set_remove(b"category:shoes", b"p-1").await.unwrap();
        store.set_remove(b"category:shoes", b"missing").await.unwrap();
        assert_eq!(
            store.set_members(b"category:shoes").await.unwrap(),
            vec![b"p-2".to_vec()]
        );

        assert!(store.set_members(b"category:hats").await.unwrap().is_empty());
    }
}
