//! Log message types
//!
//! A [`Message`] is one record read from a single partition of an ordered
//! log. Offsets strictly increase within a partition; an absent value marks
//! a tombstone (delete of the key).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One record read from a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Record key
    pub key: Vec<u8>,
    /// Record payload, `None` for a tombstone
    pub value: Option<Vec<u8>>,
    /// Position of the record within its partition
    pub offset: i64,
    /// Partition the record was read from
    #[serde(default)]
    pub partition: i32,
    /// Broker timestamp, if the source provides one
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a message carrying a value
    pub fn upsert(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, offset: i64) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            offset,
            partition: 0,
            timestamp: None,
        }
    }

    /// Create a tombstone for `key`
    pub fn tombstone(key: impl Into<Vec<u8>>, offset: i64) -> Self {
        Self {
            key: key.into(),
            value: None,
            offset,
            partition: 0,
            timestamp: None,
        }
    }

    /// Set the partition the message belongs to
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    /// Set the broker timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Whether this message deletes its key
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Key rendered as UTF-8 for logs and index members
    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    /// Payload size in bytes (0 for tombstones)
    pub fn payload_len(&self) -> usize {
        self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_message() {
        let msg = Message::upsert("product-1", b"payload".to_vec(), 42).with_partition(3);

        assert!(!msg.is_tombstone());
        assert_eq!(msg.offset, 42);
        assert_eq!(msg.partition, 3);
        assert_eq!(msg.payload_len(), 7);
        assert_eq!(msg.key_lossy(), "product-1");
    }

    #[test]
    fn test_tombstone_message() {
        let msg = Message::tombstone("product-1", 43);

        assert!(msg.is_tombstone());
        assert_eq!(msg.payload_len(), 0);
    }
}
