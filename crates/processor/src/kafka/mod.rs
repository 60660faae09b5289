//! Kafka adapter for the ordered source boundary
//!
//! [`KafkaConnector`] opens one [`KafkaPartitionSource`] per checkpoint scope:
//!
//! - explicit assignment of a single topic partition, no group subscription
//! - start at the oldest retained message or at a given offset
//! - broker-side commits disabled; checkpoints live in the checkpoint store
//! - rebalance callbacks surfaced as informational notifications
//! - any consumption error surfaced as a fatal source error
//!
//! # Example
//!
//! ```rust,no_run
//! use viewsync_processor::kafka::{KafkaConnector, KafkaSourceConfig};
//! use viewsync_processor::source::SourceConnector;
//! use viewsync_types::{CheckpointScope, StartOffset};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = KafkaConnector::new(KafkaSourceConfig {
//!     bootstrap_servers: vec!["localhost:9092".to_string()],
//!     group_id: "viewsync".to_string(),
//!     ..Default::default()
//! });
//!
//! let scope = CheckpointScope::new("product-details", "products", 0);
//! let mut source = connector.connect(&scope, StartOffset::Oldest).await?;
//! while let Some(event) = source.next_event().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod source;

pub use config::{KafkaSourceConfig, SecurityProtocol};
pub use error::{KafkaError, Result as KafkaResult};
pub use source::{KafkaConnector, KafkaPartitionSource};
