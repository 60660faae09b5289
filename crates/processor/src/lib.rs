//! Checkpointed view materialization
//!
//! This crate consumes one partition of an ordered log and materializes it
//! into a key-value view, recording a checkpoint that only ever covers
//! messages whose effects are fully applied.
//!
//! Building blocks:
//!
//! - [`source`]: ordered source boundary, with [`kafka`] as the production
//!   implementation
//! - [`materializer`]: how one message changes the view
//! - [`state`]: view stores (Redis and in-memory)
//! - [`checkpoint`]: monotonic checkpoint storage
//! - [`admission`]: shared concurrency limit for store round trips
//! - [`consumer`]: the control loop tying them together
//! - [`lifecycle`]: startup, shutdown and fatal termination of one view

pub mod admission;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod error;
pub mod kafka;
pub mod lifecycle;
pub mod materializer;
pub mod source;
pub mod state;

pub use admission::{Admitted, AdmissionLimiter, DEFAULT_PARALLELISM};

pub use checkpoint::{
    CheckpointGuard, CheckpointStore, InMemoryCheckpointStore, RedisCheckpointStore,
};

pub use config::{
    ApplyFailurePolicy, ConsumerConfig, DecodeFailurePolicy, DEFAULT_FLUSH_CAPACITY,
    DEFAULT_FLUSH_INTERVAL,
};

pub use consumer::{
    CheckpointingConsumer, ConsumerHandle, ConsumerProgress, ConsumerReport, ConsumerState,
    ExitProcess, FatalHandler, FlushTrigger, PropagateError,
};

pub use error::{
    ApplyError, CheckpointError, ErrorClass, ProcessorError, Result, SourceError, StateError,
};

pub use lifecycle::{shutdown_signal, ViewRunner};

pub use materializer::{
    materializer_fn, FieldIndexer, IndexedView, Indexer, Materializer, RawPassthrough,
    SearchIndexer, Versioned,
};

pub use source::{
    ChannelConnector, ChannelSource, ChannelSourceHandle, Notification, OrderedSource,
    SourceConnector, SourceEvent,
};

pub use state::{MemoryViewStore, RedisConfig, RedisViewStore, ViewStore};

pub use kafka::{KafkaConnector, KafkaSourceConfig};
