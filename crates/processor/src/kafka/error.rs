//! Kafka adapter errors
//!
//! Every error the adapter surfaces while a partition is being consumed is
//! transport-fatal for the consumer; the variants exist to give the log line
//! enough context to diagnose the broken session.

use thiserror::Error;

/// Result type alias for Kafka operations.
pub type Result<T> = std::result::Result<T, KafkaError>;

/// Errors raised by the Kafka source adapter.
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Creating the client failed.
    #[error("Failed to create Kafka consumer for {brokers}: {message}")]
    Connection {
        /// Error message describing the failure.
        message: String,
        /// Bootstrap servers used.
        brokers: String,
    },

    /// Assigning the partition failed.
    #[error("Failed to assign {topic}:{partition}: {message}")]
    Assignment {
        /// Error message describing the failure.
        message: String,
        /// Topic being assigned.
        topic: String,
        /// Partition being assigned.
        partition: i32,
    },

    /// Reading from the partition failed.
    #[error("Failed to consume from {topic}:{partition}: {message}")]
    Consumption {
        /// Error message describing the failure.
        message: String,
        /// Topic being consumed.
        topic: String,
        /// Partition being consumed.
        partition: i32,
    },

    /// Configuration validation error.
    #[error("Invalid Kafka configuration: {message}")]
    InvalidConfiguration {
        /// Error message describing the configuration issue.
        message: String,
        /// Field name that has invalid configuration.
        field: Option<String>,
    },
}

impl KafkaError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>, brokers: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            brokers: brokers.into(),
        }
    }

    /// Create an assignment error.
    pub fn assignment(message: impl Into<String>, topic: impl Into<String>, partition: i32) -> Self {
        Self::Assignment {
            message: message.into(),
            topic: topic.into(),
            partition,
        }
    }

    /// Create a consumption error.
    pub fn consumption(
        message: impl Into<String>,
        topic: impl Into<String>,
        partition: i32,
    ) -> Self {
        Self::Consumption {
            message: message.into(),
            topic: topic.into(),
            partition,
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>, field: Option<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
            field,
        }
    }
}
