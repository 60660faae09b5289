//! Materializers
//!
//! A [`Materializer`] applies one log message to the view. The consumer runs
//! many applies concurrently and only guarantees at-least-once delivery, so
//! every implementation must be idempotent per key.
//!
//! Provided implementations:
//!
//! - [`RawPassthrough`]: value bytes stored under the message key
//! - [`IndexedView`]: keys moved between secondary index sets
//! - [`Versioned`]: decorator that drops messages older than the last one
//!   applied for the same key
//! - [`materializer_fn`]: any async closure

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use viewsync_types::Message;

use crate::error::ApplyResult;

pub mod indexed;
pub mod raw;
pub mod versioned;

pub use indexed::{FieldIndexer, IndexedView, Indexer, SearchIndexer};
pub use raw::RawPassthrough;
pub use versioned::Versioned;

/// Applies log messages to a view
#[async_trait]
pub trait Materializer: Send + Sync {
    /// Apply `message` to the view
    ///
    /// Applying the same message more than once must leave the view in the
    /// same state as applying it once.
    async fn apply(&self, message: &Message) -> ApplyResult<()>;
}

#[async_trait]
impl<M: Materializer + ?Sized> Materializer for Arc<M> {
    async fn apply(&self, message: &Message) -> ApplyResult<()> {
        (**self).apply(message).await
    }
}

/// Materializer backed by an async closure
pub struct FnMaterializer<F> {
    f: F,
}

/// Wrap an async closure as a [`Materializer`]
///
/// ```rust
/// use viewsync_processor::materializer::{materializer_fn, Materializer};
/// use viewsync_types::Message;
///
/// # #[tokio::main]
/// # async fn main() {
/// let log = materializer_fn(|msg: Message| async move {
///     println!("{} -> {:?}", msg.key_lossy(), msg.value);
///     Ok(())
/// });
///
/// log.apply(&Message::upsert("k", "v", 1)).await.unwrap();
/// # }
/// ```
pub fn materializer_fn<F, Fut>(f: F) -> FnMaterializer<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = ApplyResult<()>> + Send,
{
    FnMaterializer { f }
}

#[async_trait]
impl<F, Fut> Materializer for FnMaterializer<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = ApplyResult<()>> + Send,
{
    async fn apply(&self, message: &Message) -> ApplyResult<()> {
        (self.f)(message.clone()).await
    }
}
