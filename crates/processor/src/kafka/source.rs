//! Kafka partition source
//!
//! Opens one explicitly assigned partition per checkpoint scope with a
//! [`StreamConsumer`]. The start offset comes from the checkpoint store, so
//! broker-side offset commits stay disabled. Rebalance callbacks are turned
//! into informational [`Notification`]s on the same event stream as the
//! messages.

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::{ClientContext, Message as _, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use viewsync_types::{CheckpointScope, Message, StartOffset};

use super::config::KafkaSourceConfig;
use super::error::KafkaError;
use crate::error::SourceError;
use crate::source::{Notification, OrderedSource, SourceConnector, SourceEvent};

/// Consumer context forwarding rebalance callbacks as notifications
struct PartitionContext {
    notifications: mpsc::UnboundedSender<Notification>,
}

fn partition_names(tpl: &TopicPartitionList) -> Vec<String> {
    tpl.elements()
        .iter()
        .map(|elem| format!("{}:{}", elem.topic(), elem.partition()))
        .collect()
}

impl ClientContext for PartitionContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!(facility = fac, "librdkafka: {}", log_message),
            RDKafkaLogLevel::Warning => warn!(facility = fac, "librdkafka: {}", log_message),
            _ => debug!(facility = fac, "librdkafka: {}", log_message),
        }
    }

    fn error(&self, error: rdkafka::error::KafkaError, reason: &str) {
        error!("Kafka client error: {}: {}", error, reason);
    }
}

impl ConsumerContext for PartitionContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        let notification = match rebalance {
            Rebalance::Revoke(tpl) => Notification::Revoked {
                partitions: partition_names(tpl),
            },
            Rebalance::Assign(tpl) => Notification::Assigned {
                partitions: partition_names(tpl),
            },
            Rebalance::Error(err) => Notification::Info(format!("rebalance error: {}", err)),
        };
        let _ = self.notifications.send(notification);
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Error(err) = rebalance {
            let _ = self
                .notifications
                .send(Notification::Info(format!("post-rebalance error: {}", err)));
        }
    }
}

/// One assigned Kafka partition
pub struct KafkaPartitionSource {
    consumer: StreamConsumer<PartitionContext>,
    notifications: mpsc::UnboundedReceiver<Notification>,
    topic: String,
    partition: i32,
    closed: bool,
}

impl KafkaPartitionSource {
    /// Create a consumer and assign `topic`/`partition` at `start`
    pub fn open(
        config: &KafkaSourceConfig,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<Self, KafkaError> {
        config
            .validate()
            .map_err(|message| KafkaError::invalid_config(message, None))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let context = PartitionContext { notifications: tx };

        let mut client_config = ClientConfig::new();
        for (key, value) in config.to_rdkafka_config() {
            client_config.set(key, value);
        }

        let consumer: StreamConsumer<PartitionContext> = client_config
            .create_with_context(context)
            .map_err(|e| KafkaError::connection(e.to_string(), config.brokers()))?;

        let offset = match start {
            StartOffset::Oldest => Offset::Beginning,
            StartOffset::At(offset) => Offset::Offset(offset),
        };

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, offset)
            .map_err(|e| KafkaError::assignment(e.to_string(), topic, partition))?;
        consumer
            .assign(&assignment)
            .map_err(|e| KafkaError::assignment(e.to_string(), topic, partition))?;

        info!(topic, partition, start = %start, "Assigned Kafka partition");

        Ok(Self {
            consumer,
            notifications: rx,
            topic: topic.to_string(),
            partition,
            closed: false,
        })
    }
}

#[async_trait]
impl OrderedSource for KafkaPartitionSource {
    async fn next_event(&mut self) -> Option<SourceEvent> {
        if self.closed {
            return None;
        }

        tokio::select! {
            biased;

            Some(notification) = self.notifications.recv() => {
                Some(SourceEvent::Notification(notification))
            }
            received = self.consumer.recv() => match received {
                Ok(msg) => Some(SourceEvent::Message(Message {
                    key: msg.key().map(|k| k.to_vec()).unwrap_or_default(),
                    value: msg.payload().map(|p| p.to_vec()),
                    offset: msg.offset(),
                    partition: msg.partition(),
                    timestamp: msg
                        .timestamp()
                        .to_millis()
                        .and_then(DateTime::from_timestamp_millis),
                })),
                Err(e) => Some(SourceEvent::Error(SourceError::Kafka(
                    KafkaError::consumption(e.to_string(), self.topic.clone(), self.partition),
                ))),
            },
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.consumer.unassign() {
            warn!(topic = %self.topic, partition = self.partition, "Failed to unassign partition: {}", e);
        }
        info!(topic = %self.topic, partition = self.partition, "Released Kafka partition");
    }
}

/// Opens [`KafkaPartitionSource`]s for checkpoint scopes
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    config: KafkaSourceConfig,
}

impl KafkaConnector {
    /// Create a connector
    pub fn new(config: KafkaSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceConnector for KafkaConnector {
    async fn connect(
        &self,
        scope: &CheckpointScope,
        start: StartOffset,
    ) -> Result<Box<dyn OrderedSource>, SourceError> {
        let source = KafkaPartitionSource::open(&self.config, &scope.topic, scope.partition, start)?;
        Ok(Box::new(source))
    }
}
