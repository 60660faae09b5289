//! Raw passthrough view

use async_trait::async_trait;
use tracing::trace;
use viewsync_types::Message;

use super::Materializer;
use crate::error::ApplyResult;
use crate::state::ViewStore;

/// Stores message values verbatim under their key
///
/// A tombstone deletes the key. Both operations are plain overwrites, so
/// replaying a message is harmless.
pub struct RawPassthrough<S> {
    store: S,
}

impl<S: ViewStore> RawPassthrough<S> {
    /// Create a raw view over `store`
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: ViewStore> Materializer for RawPassthrough<S> {
    async fn apply(&self, message: &Message) -> ApplyResult<()> {
        match &message.value {
            Some(value) => {
                trace!(offset = message.offset, bytes = value.len(), "Storing raw value");
                self.store.set(&message.key, value).await?;
            }
            None => {
                trace!(offset = message.offset, "Removing key");
                self.store.delete(&message.key).await?;
            }
        }
        Ok(())
    }
}
