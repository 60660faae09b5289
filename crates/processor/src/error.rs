//! Error types for the view processor
//!
//! Errors are grouped by the component that raises them. They all surface to
//! the consumer control loop as a [`ProcessorError`], whose [`ErrorClass`]
//! decides how the loop reacts.

use std::fmt;
use thiserror::Error;

use crate::kafka::KafkaError;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// The ordered source failed or ended
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// A message could not be applied to the view
    #[error("failed to apply message at offset {offset} (key '{key}'): {source}")]
    Apply {
        offset: i64,
        key: String,
        #[source]
        source: ApplyError,
    },

    /// An apply task panicked or was cancelled
    #[error("apply task at offset {offset:?} aborted: {reason}")]
    TaskAborted { offset: Option<i64>, reason: String },

    /// Checkpoint store errors
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The consumer was already stopped or failed
    #[error("consumer is not running: {0}")]
    NotRunning(String),
}

impl ProcessorError {
    /// Where this error sits in the failure taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            ProcessorError::Source(_) => ErrorClass::TransportFatal,
            ProcessorError::Apply { source, .. } => match source {
                ApplyError::Decode { .. } => ErrorClass::DecodeFatal,
                _ => ErrorClass::ApplicationFatal,
            },
            ProcessorError::TaskAborted { .. } => ErrorClass::ApplicationFatal,
            ProcessorError::Checkpoint(_) => ErrorClass::Checkpoint,
            ProcessorError::Configuration(_) | ProcessorError::NotRunning(_) => {
                ErrorClass::Lifecycle
            }
        }
    }

    /// Whether the process must terminate on this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::TransportFatal | ErrorClass::ApplicationFatal | ErrorClass::DecodeFatal
        )
    }

    /// Offset the error relates to, if any
    pub fn offset(&self) -> Option<i64> {
        match self {
            ProcessorError::Apply { offset, .. } => Some(*offset),
            ProcessorError::TaskAborted { offset, .. } => *offset,
            ProcessorError::Checkpoint(CheckpointError::Regression { attempted, .. }) => {
                Some(*attempted)
            }
            _ => None,
        }
    }
}

/// Failure taxonomy used by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Source connectivity or session failure
    TransportFatal,
    /// Materializer or view store failure during apply
    ApplicationFatal,
    /// Malformed message payload
    DecodeFatal,
    /// Checkpoint store failure
    Checkpoint,
    /// Misuse of the consumer lifecycle or bad configuration
    Lifecycle,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::TransportFatal => write!(f, "transport-fatal"),
            ErrorClass::ApplicationFatal => write!(f, "application-fatal"),
            ErrorClass::DecodeFatal => write!(f, "decode-fatal"),
            ErrorClass::Checkpoint => write!(f, "checkpoint"),
            ErrorClass::Lifecycle => write!(f, "lifecycle"),
        }
    }
}

/// Errors reported by an ordered source
#[derive(Error, Debug)]
pub enum SourceError {
    /// The source stopped producing events without being closed
    #[error("source ended unexpectedly on {topic}:{partition}")]
    Ended { topic: String, partition: i32 },

    /// Connecting to the source failed
    #[error("failed to open source: {0}")]
    Connect(String),

    /// Kafka client errors
    #[error(transparent)]
    Kafka(#[from] KafkaError),
}

/// Errors returned by a materializer
#[derive(Error, Debug)]
pub enum ApplyError {
    /// The payload could not be decoded
    #[error("malformed payload for key '{key}': {reason}")]
    Decode { key: String, reason: String },

    /// The view store rejected an operation
    #[error("view store error: {0}")]
    State(#[from] StateError),

    /// The apply did not finish within the configured timeout
    #[error("apply timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// View-specific failure
    #[error("{0}")]
    Other(String),
}

impl ApplyError {
    /// Build a decode error
    pub fn decode(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        ApplyError::Decode {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure is a malformed record
    pub fn is_decode(&self) -> bool {
        matches!(self, ApplyError::Decode { .. })
    }
}

/// View store operation errors
#[derive(Error, Debug)]
pub enum StateError {
    /// Store backend error
    #[error("storage error in {backend_type}: {details}")]
    StorageError {
        backend_type: String,
        details: String,
    },

    /// Stored value could not be decoded
    #[error("state deserialization failed for key '{key}': {reason}")]
    DeserializationFailed { key: String, reason: String },

    /// The admission limiter was closed
    #[error("admission limiter closed")]
    AdmissionClosed,
}

impl StateError {
    /// Build a storage error for `backend_type`
    pub fn storage(backend_type: &str, details: impl Into<String>) -> Self {
        StateError::StorageError {
            backend_type: backend_type.to_string(),
            details: details.into(),
        }
    }
}

/// Checkpoint store errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The underlying store failed
    #[error("checkpoint store error for {scope}: {source}")]
    Store {
        scope: String,
        #[source]
        source: StateError,
    },

    /// A lower value than the committed one was about to be written
    #[error("checkpoint regression for {scope}: attempted {attempted}, committed {committed}")]
    Regression {
        scope: String,
        attempted: i64,
        committed: i64,
    },
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for view store operations
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Result type alias for materializer operations
pub type ApplyResult<T> = std::result::Result<T, ApplyError>;

/// Result type alias for checkpoint operations
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;
