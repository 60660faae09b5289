//! Core types for viewsync
//!
//! This crate provides the data model shared by the consumer core, its
//! adapters and the binary: log messages, checkpoint scopes and the change
//! records consumed by derived views.

pub mod change;
pub mod message;
pub mod scope;

pub use change::StateChange;
pub use message::Message;
pub use scope::{CheckpointScope, StartOffset};
