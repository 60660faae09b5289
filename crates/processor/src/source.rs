//! Ordered source boundary
//!
//! The consumer reads one partition through an [`OrderedSource`]. Messages,
//! errors and rebalance notifications arrive on a single event stream so the
//! control loop can select over it alongside its timers.
//!
//! [`ChannelSource`] is an in-process implementation fed through a
//! [`ChannelSourceHandle`]; the Kafka implementation lives in
//! [`crate::kafka`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;
use viewsync_types::{CheckpointScope, Message, StartOffset};

use crate::error::SourceError;

/// One item produced by a source
#[derive(Debug)]
pub enum SourceEvent {
    /// Next message in offset order
    Message(Message),
    /// The source session broke; always fatal
    Error(SourceError),
    /// Informational notification, logged only
    Notification(Notification),
}

/// Informational events from the group coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Partitions were assigned to this member
    Assigned { partitions: Vec<String> },
    /// Partitions were revoked from this member
    Revoked { partitions: Vec<String> },
    /// Anything else worth a log line
    Info(String),
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notification::Assigned { partitions } => {
                write!(f, "assigned [{}]", partitions.join(", "))
            }
            Notification::Revoked { partitions } => {
                write!(f, "revoked [{}]", partitions.join(", "))
            }
            Notification::Info(info) => write!(f, "{}", info),
        }
    }
}

/// A single partition of an ordered log
///
/// `next_event` must be cancel safe: the consumer calls it inside
/// `tokio::select!` and drops the future whenever another branch wins.
#[async_trait]
pub trait OrderedSource: Send {
    /// Wait for the next event; `None` once the source has ended
    async fn next_event(&mut self) -> Option<SourceEvent>;

    /// Release the partition
    async fn close(&mut self);
}

/// Opens a source for a scope at a start position
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Open `scope`'s partition at `start`
    async fn connect(
        &self,
        scope: &CheckpointScope,
        start: StartOffset,
    ) -> Result<Box<dyn OrderedSource>, SourceError>;
}

/// In-process source backed by an unbounded channel
pub struct ChannelSource {
    events: mpsc::UnboundedReceiver<SourceEvent>,
    closed: Arc<AtomicBool>,
}

/// Producer side of a [`ChannelSource`]
///
/// Dropping every handle ends the source.
#[derive(Clone)]
pub struct ChannelSourceHandle {
    events: mpsc::UnboundedSender<SourceEvent>,
    closed: Arc<AtomicBool>,
}

impl ChannelSource {
    /// Create a connected source/handle pair
    pub fn new() -> (Self, ChannelSourceHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                events: rx,
                closed: closed.clone(),
            },
            ChannelSourceHandle { events: tx, closed },
        )
    }
}

impl ChannelSourceHandle {
    /// Queue a message; returns `false` if the source is gone
    pub fn push(&self, message: Message) -> bool {
        self.events.send(SourceEvent::Message(message)).is_ok()
    }

    /// Queue every message of `messages`
    pub fn push_all(&self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            if !self.push(message) {
                break;
            }
        }
    }

    /// Signal a broken session
    pub fn fail(&self, error: SourceError) -> bool {
        self.events.send(SourceEvent::Error(error)).is_ok()
    }

    /// Queue an informational notification
    pub fn notify(&self, notification: Notification) -> bool {
        self.events
            .send(SourceEvent::Notification(notification))
            .is_ok()
    }

    /// Whether the consumer released the source
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderedSource for ChannelSource {
    async fn next_event(&mut self) -> Option<SourceEvent> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.events.recv().await
    }

    async fn close(&mut self) {
        debug!("Closing channel source");
        self.closed.store(true, Ordering::SeqCst);
        self.events.close();
    }
}

/// Connector handing out prepared [`ChannelSource`]s
///
/// Records every start position requested, for assertions.
#[derive(Default)]
pub struct ChannelConnector {
    sources: Mutex<Vec<ChannelSource>>,
    requested: Mutex<Vec<StartOffset>>,
}

impl ChannelConnector {
    /// Create a connector with no prepared sources
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare a source for the next `connect` call and return its handle
    pub fn prepare(&self) -> ChannelSourceHandle {
        let (source, handle) = ChannelSource::new();
        if let Ok(mut sources) = self.sources.lock() {
            sources.push(source);
        }
        handle
    }

    /// Start positions requested so far
    pub fn requested(&self) -> Vec<StartOffset> {
        self.requested
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceConnector for ChannelConnector {
    async fn connect(
        &self,
        scope: &CheckpointScope,
        start: StartOffset,
    ) -> Result<Box<dyn OrderedSource>, SourceError> {
        if let Ok(mut requested) = self.requested.lock() {
            requested.push(start);
        }

        let source = self
            .sources
            .lock()
            .ok()
            .and_then(|mut sources| (!sources.is_empty()).then(|| sources.remove(0)))
            .ok_or_else(|| SourceError::Connect(format!("no source prepared for {}", scope)))?;

        debug!(scope = %scope, start = %start, "Connected channel source");
        Ok(Box::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_delivers_in_order() {
        let (mut source, handle) = ChannelSource::new();
        handle.push_all((1..=3).map(|i| Message::upsert("k", vec![i as u8], i)));
        drop(handle);

        let mut offsets = Vec::new();
        while let Some(event) = source.next_event().await {
            if let SourceEvent::Message(msg) = event {
                offsets.push(msg.offset);
            }
        }
        assert_eq!(offsets, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_close_ends_source() {
        let (mut source, handle) = ChannelSource::new();
        handle.push(Message::upsert("k", "v", 1));

        source.close().await;
        assert!(handle.is_closed());
        assert!(source.next_event().await.is_none());
        assert!(!handle.push(Message::upsert("k", "v", 2)));
    }

    #[tokio::test]
    async fn test_connector_records_start_offsets() {
        let connector = ChannelConnector::new();
        let _handle = connector.prepare();
        let scope = CheckpointScope::new("v", "t", 0);

        assert!(connector.connect(&scope, StartOffset::Oldest).await.is_ok());
        assert!(connector.connect(&scope, StartOffset::At(5)).await.is_err());
        assert_eq!(
            connector.requested(),
            vec![StartOffset::Oldest, StartOffset::At(5)]
        );
    }
}
