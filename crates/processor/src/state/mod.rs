//! View stores
//!
//! The view is the external key-value/set store a materializer keeps current.
//! [`ViewStore`] is the narrow surface materializers write through; the
//! consumer never calls it directly.
//!
//! - [`MemoryViewStore`]: DashMap-backed, for tests and embedding
//! - [`RedisViewStore`]: Redis strings and sets behind a connection manager
//!
//! Wrap either in [`crate::admission::Admitted`] to cap how many store
//! operations run at once.

pub mod backend;
pub mod memory;
pub mod redis_backend;

pub use backend::ViewStore;
pub use memory::{MemoryStoreStats, MemoryViewStore};
pub use redis_backend::{RedisConfig, RedisConfigBuilder, RedisStats, RedisViewStore};
