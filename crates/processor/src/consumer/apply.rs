//! Single-message apply task

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use viewsync_types::Message;

use crate::config::{ApplyFailurePolicy, ConsumerConfig, DecodeFailurePolicy};
use crate::error::{ApplyError, ProcessorError};
use crate::materializer::Materializer;

/// How an apply task reacts to failures
#[derive(Debug, Clone)]
pub(crate) struct ApplyPolicy {
    pub failure: ApplyFailurePolicy,
    pub decode: DecodeFailurePolicy,
    pub timeout: Option<Duration>,
}

impl From<&ConsumerConfig> for ApplyPolicy {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            failure: config.apply_failure,
            decode: config.decode_failure,
            timeout: config.apply_timeout,
        }
    }
}

/// How a message left the in-flight set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    /// The materializer succeeded
    Applied,
    /// The payload was malformed and dropped
    Skipped,
}

/// Result of one apply task, tagged with its offset
pub(crate) type TaskOutput = (i64, Result<Applied, ProcessorError>);

/// Apply `message`, honouring the retry, decode and timeout policies
pub(crate) async fn apply_message(
    message: Message,
    materializer: Arc<dyn Materializer>,
    policy: Arc<ApplyPolicy>,
) -> TaskOutput {
    let offset = message.offset;
    let max_attempts = policy.failure.max_attempts();
    let mut attempt = 1;

    loop {
        let result = match policy.timeout {
            Some(limit) => tokio::time::timeout(limit, materializer.apply(&message))
                .await
                .unwrap_or_else(|_| {
                    Err(ApplyError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    })
                }),
            None => materializer.apply(&message).await,
        };

        let err = match result {
            Ok(()) => return (offset, Ok(Applied::Applied)),
            Err(err) => err,
        };

        if err.is_decode() {
            if policy.decode == DecodeFailurePolicy::SkipAndLog {
                warn!(
                    offset,
                    key = %message.key_lossy(),
                    "Skipping malformed message: {}", err
                );
                return (offset, Ok(Applied::Skipped));
            }
            return (offset, Err(apply_failed(&message, err)));
        }

        if attempt >= max_attempts {
            return (offset, Err(apply_failed(&message, err)));
        }

        let delay = policy.failure.backoff(attempt);
        warn!(
            offset,
            attempt,
            max_attempts,
            "Apply failed, retrying in {:?}: {}", delay, err
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

fn apply_failed(message: &Message, source: ApplyError) -> ProcessorError {
    ProcessorError::Apply {
        offset: message.offset,
        key: message.key_lossy(),
        source,
    }
}
