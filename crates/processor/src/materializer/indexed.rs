//! Derived secondary-index views
//!
//! Messages carry a JSON [`StateChange`] with the entity's old and new state.
//! An [`Indexer`] maps a state to the index set the entity belongs in; the
//! view moves the message key from the old set to the new one.
//!
//! The set a key currently occupies is also recorded under a membership key,
//! so a bare tombstone (no payload at all) can still remove the key from the
//! set it last occupied.

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;
use viewsync_types::{Message, StateChange};

use super::Materializer;
use crate::error::{ApplyError, ApplyResult, StateError};
use crate::state::ViewStore;

/// Maps an entity state to the index set it belongs in
pub trait Indexer: Send + Sync {
    /// Set key for `state`, `None` if the entity is in no set
    fn bucket(&self, state: &Value) -> Option<String>;
}

/// Groups entities by the value of one field
///
/// `{"category": "shoes"}` with field `category` and prefix `category:` lands
/// in set `category:shoes`.
#[derive(Debug, Clone)]
pub struct FieldIndexer {
    field: String,
    set_prefix: String,
}

impl FieldIndexer {
    /// Index by `field`, using the field value itself as set key
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            set_prefix: String::new(),
        }
    }

    /// Prepend `prefix` to every set key
    pub fn with_set_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.set_prefix = prefix.into();
        self
    }
}

impl Indexer for FieldIndexer {
    fn bucket(&self, state: &Value) -> Option<String> {
        let value = match state.get(&self.field)? {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        Some(format!("{}{}", self.set_prefix, value))
    }
}

/// Collects entities whose text fields mention a term
///
/// Matching is a case-sensitive substring test over each configured string
/// field.
#[derive(Debug, Clone)]
pub struct SearchIndexer {
    term: String,
    fields: Vec<String>,
    set: String,
}

impl SearchIndexer {
    /// Add entities whose `fields` contain `term` to set `set`
    pub fn new(term: impl Into<String>, fields: Vec<String>, set: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            fields,
            set: set.into(),
        }
    }
}

impl Indexer for SearchIndexer {
    fn bucket(&self, state: &Value) -> Option<String> {
        let matches = self.fields.iter().any(|field| {
            state
                .get(field)
                .and_then(Value::as_str)
                .map(|text| text.contains(&self.term))
                .unwrap_or(false)
        });
        matches.then(|| self.set.clone())
    }
}

/// View maintaining secondary index sets from old/new change records
pub struct IndexedView<S, I> {
    store: S,
    indexer: I,
    membership_prefix: Vec<u8>,
}

impl<S: ViewStore, I: Indexer> IndexedView<S, I> {
    /// Create an indexed view named `name`
    ///
    /// The name scopes the membership keys, so several indexed views can
    /// share one store.
    pub fn new(name: &str, store: S, indexer: I) -> Self {
        Self {
            store,
            indexer,
            membership_prefix: format!("membership:{}:", name).into_bytes(),
        }
    }

    fn membership_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = self.membership_prefix.clone();
        full.extend_from_slice(key);
        full
    }

    async fn recorded_bucket(&self, membership_key: &[u8]) -> ApplyResult<Option<String>> {
        match self.store.get(membership_key).await? {
            Some(raw) => String::from_utf8(raw).map(Some).map_err(|e| {
                ApplyError::State(StateError::DeserializationFailed {
                    key: String::from_utf8_lossy(membership_key).into_owned(),
                    reason: e.to_string(),
                })
            }),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<S: ViewStore, I: Indexer> Materializer for IndexedView<S, I> {
    async fn apply(&self, message: &Message) -> ApplyResult<()> {
        let change: Option<StateChange<Value>> = match &message.value {
            Some(payload) => Some(
                serde_json::from_slice(payload)
                    .map_err(|e| ApplyError::decode(message.key_lossy(), e))?,
            ),
            None => None,
        };

        let (old_bucket, new_bucket) = match &change {
            Some(change) => (
                change.old.as_ref().and_then(|s| self.indexer.bucket(s)),
                change.new.as_ref().and_then(|s| self.indexer.bucket(s)),
            ),
            None => (None, None),
        };

        if change.as_ref().map_or(false, |c| c.old.is_some() && c.new.is_some())
            && old_bucket == new_bucket
        {
            trace!(offset = message.offset, "Index unchanged");
            return Ok(());
        }

        let membership_key = self.membership_key(&message.key);
        let recorded = self.recorded_bucket(&membership_key).await?;

        let mut stale: Vec<&String> = Vec::with_capacity(2);
        for bucket in [old_bucket.as_ref(), recorded.as_ref()].into_iter().flatten() {
            if Some(bucket) != new_bucket.as_ref() && !stale.contains(&bucket) {
                stale.push(bucket);
            }
        }

        for bucket in stale {
            trace!(offset = message.offset, set = %bucket, "Removing from index");
            self.store.set_remove(bucket.as_bytes(), &message.key).await?;
        }

        match &new_bucket {
            Some(bucket) => {
                trace!(offset = message.offset, set = %bucket, "Adding to index");
                self.store.set_add(bucket.as_bytes(), &message.key).await?;
                if recorded.as_ref() != Some(bucket) {
                    self.store.set(&membership_key, bucket.as_bytes()).await?;
                }
            }
            None => {
                if recorded.is_some() {
                    self.store.delete(&membership_key).await?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryViewStore;
    use serde_json::json;

    fn change(old: Option<Value>, new: Option<Value>) -> Vec<u8> {
        StateChange { old, new }.to_json().unwrap()
    }

    fn categories(store: &MemoryViewStore) -> IndexedView<MemoryViewStore, FieldIndexer> {
        IndexedView::new(
            "categories",
            store.clone(),
            FieldIndexer::new("category").with_set_prefix("category:"),
        )
    }

    #[test]
    fn test_field_indexer() {
        let indexer = FieldIndexer::new("category");
        assert_eq!(indexer.bucket(&json!({"category": "shoes"})), Some("shoes".to_string()));
        assert_eq!(indexer.bucket(&json!({"category": 7})), Some("7".to_string()));
        assert_eq!(indexer.bucket(&json!({"category": ""})), None);
        assert_eq!(indexer.bucket(&json!({"name": "x"})), None);
    }

    #[test]
    fn test_search_indexer() {
        let indexer = SearchIndexer::new(
            "lorem",
            vec!["title".to_string(), "description".to_string()],
            "search:lorem",
        );
        assert_eq!(
            indexer.bucket(&json!({"title": "x", "description": "lorem ipsum"})),
            Some("search:lorem".to_string())
        );
        assert_eq!(indexer.bucket(&json!({"title": "Lorem"})), None);
        assert_eq!(indexer.bucket(&json!({"longtext": "lorem"})), None);
    }

    #[tokio::test]
    async fn test_category_move() {
        let store = MemoryViewStore::new();
        let view = categories(&store);

        let created = change(None, Some(json!({"category": "shoes"})));
        view.apply(&Message::upsert("p-1", created, 1)).await.unwrap();
        assert_eq!(store.members_utf8("category:shoes"), vec!["p-1"]);

        let moved = change(
            Some(json!({"category": "shoes"})),
            Some(json!({"category": "boots"})),
        );
        view.apply(&Message::upsert("p-1", moved, 2)).await.unwrap();
        assert!(store.members_utf8("category:shoes").is_empty());
        assert_eq!(store.members_utf8("category:boots"), vec!["p-1"]);
    }

    #[tokio::test]
    async fn test_unchanged_bucket_is_noop() {
        let store = MemoryViewStore::new();
        let view = categories(&store);

        let same = change(
            Some(json!({"category": "shoes", "price": 1})),
            Some(json!({"category": "shoes", "price": 2})),
        );
        view.apply(&Message::upsert("p-1", same, 1)).await.unwrap();

        assert_eq!(store.stats().member_ops, 0);
        assert_eq!(store.stats().write_count, 0);
    }

    #[tokio::test]
    async fn test_bare_tombstone_uses_recorded_bucket() {
        let store = MemoryViewStore::new();
        let view = categories(&store);

        let created = change(None, Some(json!({"category": "hats"})));
        view.apply(&Message::upsert("p-9", created, 1)).await.unwrap();
        assert_eq!(store.members_utf8("category:hats"), vec!["p-9"]);

        view.apply(&Message::tombstone("p-9", 2)).await.unwrap();
        assert!(store.members_utf8("category:hats").is_empty());
        assert!(store.keys_utf8().is_empty());
    }

    #[tokio::test]
    async fn test_tombstone_on_absent_key_is_noop() {
        let store = MemoryViewStore::new();
        let view = categories(&store);

        view.apply(&Message::tombstone("ghost", 1)).await.unwrap();
        view.apply(&Message::tombstone("ghost", 1)).await.unwrap();

        assert!(store.keys_utf8().is_empty());
        assert_eq!(store.stats().write_count, 0);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = MemoryViewStore::new();
        let view = categories(&store);
        let msg = Message::upsert(
            "p-1",
            change(
                Some(json!({"category": "shoes"})),
                Some(json!({"category": "boots"})),
            ),
            4,
        );

        view.apply(&msg).await.unwrap();
        view.apply(&msg).await.unwrap();

        assert!(store.members_utf8("category:shoes").is_empty());
        assert_eq!(store.members_utf8("category:boots"), vec!["p-1"]);
        assert_eq!(store.value_utf8("membership:categories:p-1"), Some("category:boots".to_string()));
    }

    #[tokio::test]
    async fn test_search_view_leaves_set_when_term_disappears() {
        let store = MemoryViewStore::new();
        let view = IndexedView::new(
            "lorem",
            store.clone(),
            SearchIndexer::new("lorem", vec!["title".to_string()], "search:lorem"),
        );

        let matched = change(None, Some(json!({"title": "lorem ipsum"})));
        view.apply(&Message::upsert("p-1", matched, 1)).await.unwrap();
        assert_eq!(store.members_utf8("search:lorem"), vec!["p-1"]);

        let unmatched = change(
            Some(json!({"title": "lorem ipsum"})),
            Some(json!({"title": "dolor"})),
        );
        view.apply(&Message::upsert("p-1", unmatched, 2)).await.unwrap();
        assert!(store.members_utf8("search:lorem").is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_decode_error() {
        let store = MemoryViewStore::new();
        let view = categories(&store);

        let err = view
            .apply(&Message::upsert("p-1", "not json", 1))
            .await
            .unwrap_err();
        assert!(err.is_decode());
    }
}
