//! Consumer configuration
//!
//! Tuning for the checkpointing consumer: the dual flush trigger and the
//! policies applied when a message cannot be materialized.

use crate::error::{ProcessorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default interval between time-triggered checkpoint cycles
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of dispatched messages that triggers a checkpoint cycle
pub const DEFAULT_FLUSH_CAPACITY: usize = 10_000;

/// Checkpointing consumer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// A checkpoint cycle starts at least this often while messages arrive
    pub flush_interval: Duration,

    /// A checkpoint cycle starts once this many messages were dispatched
    /// since the previous one
    pub flush_capacity: usize,

    /// What to do when applying a message fails
    pub apply_failure: ApplyFailurePolicy,

    /// What to do with a message whose payload cannot be decoded
    pub decode_failure: DecodeFailurePolicy,

    /// Upper bound for a single apply attempt; exceeding it counts as a
    /// failed apply
    pub apply_timeout: Option<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_capacity: DEFAULT_FLUSH_CAPACITY,
            apply_failure: ApplyFailurePolicy::Fatal,
            decode_failure: DecodeFailurePolicy::Fatal,
            apply_timeout: None,
        }
    }
}

impl ConsumerConfig {
    /// Set the flush interval
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the flush capacity
    pub fn with_flush_capacity(mut self, capacity: usize) -> Self {
        self.flush_capacity = capacity;
        self
    }

    /// Set the apply failure policy
    pub fn with_apply_failure(mut self, policy: ApplyFailurePolicy) -> Self {
        self.apply_failure = policy;
        self
    }

    /// Set the decode failure policy
    pub fn with_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.decode_failure = policy;
        self
    }

    /// Set the per-attempt apply timeout
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = Some(timeout);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            return Err(ProcessorError::Configuration(
                "flush_interval must be greater than 0".into(),
            ));
        }

        if self.flush_capacity == 0 {
            return Err(ProcessorError::Configuration(
                "flush_capacity must be greater than 0".into(),
            ));
        }

        if let Some(timeout) = self.apply_timeout {
            if timeout.is_zero() {
                return Err(ProcessorError::Configuration(
                    "apply_timeout must be greater than 0".into(),
                ));
            }
        }

        self.apply_failure.validate()
    }
}

/// Reaction to a failed apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ApplyFailurePolicy {
    /// Terminate on the first failure
    Fatal,
    /// Retry with exponential backoff; exhaustion is fatal
    Retry {
        /// Attempts including the first one
        max_attempts: u32,
        /// Delay before the second attempt
        initial_backoff: Duration,
        /// Upper bound for the delay
        max_backoff: Duration,
    },
}

impl ApplyFailurePolicy {
    /// Total attempts allowed, including the first one
    pub fn max_attempts(&self) -> u32 {
        match self {
            ApplyFailurePolicy::Fatal => 1,
            ApplyFailurePolicy::Retry { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Delay before attempt `attempt + 1`, with `attempt` starting at 1
    pub fn backoff(&self, attempt: u32) -> Duration {
        match self {
            ApplyFailurePolicy::Fatal => Duration::ZERO,
            ApplyFailurePolicy::Retry {
                initial_backoff,
                max_backoff,
                ..
            } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial_backoff.saturating_mul(factor).min(*max_backoff)
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if let ApplyFailurePolicy::Retry {
            max_attempts,
            initial_backoff,
            max_backoff,
        } = self
        {
            if *max_attempts == 0 {
                return Err(ProcessorError::Configuration(
                    "retry max_attempts must be greater than 0".into(),
                ));
            }
            if max_backoff < initial_backoff {
                return Err(ProcessorError::Configuration(
                    "retry max_backoff must be >= initial_backoff".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Reaction to a payload that cannot be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Treat like any other failed apply
    Fatal,
    /// Log the record and count it as applied
    SkipAndLog,
}
