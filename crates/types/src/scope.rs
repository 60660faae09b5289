//! Checkpoint scoping and start positions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the checkpoint of one view consuming one partition
///
/// Several views may share a checkpoint store; the scope keeps their
/// checkpoints apart.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointScope {
    /// Name of the view being materialized
    pub view: String,
    /// Topic the view consumes
    pub topic: String,
    /// Partition the view consumes
    pub partition: i32,
}

impl CheckpointScope {
    /// Create a new scope
    pub fn new(view: impl Into<String>, topic: impl Into<String>, partition: i32) -> Self {
        Self {
            view: view.into(),
            topic: topic.into(),
            partition,
        }
    }

    /// Key under which the checkpoint is persisted
    pub fn storage_key(&self) -> String {
        format!("checkpoint:{}:{}:{}", self.view, self.topic, self.partition)
    }
}

impl fmt::Display for CheckpointScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.view, self.topic, self.partition)
    }
}

/// Where a source starts reading a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOffset {
    /// Oldest message still retained by the log
    Oldest,
    /// A concrete offset
    At(i64),
}

impl StartOffset {
    /// Resume position for a previously committed checkpoint
    ///
    /// Everything up to and including the checkpoint has been applied, so
    /// reading continues at the next offset.
    pub fn resume_after(checkpoint: Option<i64>) -> Self {
        match checkpoint {
            Some(offset) => StartOffset::At(offset + 1),
            None => StartOffset::Oldest,
        }
    }
}

impl fmt::Display for StartOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartOffset::Oldest => write!(f, "oldest"),
            StartOffset::At(offset) => write!(f, "{}", offset),
        }
    }
}
