//! Integration tests against real Kafka and Redis
//!
//! These tests require running brokers:
//!
//! 1. Start Kafka and Redis:
//!    ```bash
//!    docker run -d --name kafka -p 9092:9092 apache/kafka:latest
//!    docker run -d --name redis -p 6379:6379 redis:7
//!    ```
//!
//! 2. Run tests:
//!    ```bash
//!    cargo test --test kafka_redis_integration -- --ignored --nocapture
//!    ```

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use viewsync_processor::checkpoint::{CheckpointStore, RedisCheckpointStore};
use viewsync_processor::kafka::{KafkaConnector, KafkaSourceConfig};
use viewsync_processor::materializer::RawPassthrough;
use viewsync_processor::state::{RedisConfig, RedisViewStore, ViewStore};
use viewsync_processor::{ConsumerConfig, PropagateError, ViewRunner};
use viewsync_types::CheckpointScope;

const BROKERS: &str = "localhost:9092";
const REDIS_URL: &str = "redis://localhost:6379";

/// Topic and key prefix unique to one test run
fn unique(name: &str) -> String {
    format!("{}-{}", name, chrono::Utc::now().timestamp_millis())
}

async fn produce(topic: &str, count: usize) {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", BROKERS)
        .set("message.timeout.ms", "5000")
        .create()
        .expect("Failed to create producer");

    for i in 0..count {
        let key = format!("p-{}", i);
        let value = format!("value-{}", i);
        producer
            .send(
                FutureRecord::to(topic).partition(0).key(&key).payload(&value),
                Duration::from_secs(5),
            )
            .await
            .expect("Failed to produce");
    }
}

async fn redis(prefix: &str) -> RedisViewStore {
    let config = RedisConfig::builder()
        .url(REDIS_URL)
        .key_prefix(prefix)
        .build()
        .unwrap();
    RedisViewStore::new(config).await.expect("Failed to connect to Redis")
}

fn connector() -> Arc<KafkaConnector> {
    Arc::new(KafkaConnector::new(KafkaSourceConfig {
        bootstrap_servers: vec![BROKERS.to_string()],
        group_id: unique("viewsync-it"),
        ..Default::default()
    }))
}

#[tokio::test]
#[ignore] // Requires Kafka and Redis running
async fn test_materializes_partition_and_checkpoints_last_offset() {
    let topic = unique("viewsync-products");
    let prefix = format!("{}:", unique("it"));
    produce(&topic, 20).await;

    let view = redis(&prefix).await;
    let checkpoints = Arc::new(RedisCheckpointStore::with_connection(
        view.connection(),
        prefix.clone(),
    ));
    let scope = CheckpointScope::new("details", &topic, 0);

    let handle = ViewRunner::new(
        scope.clone(),
        connector(),
        Arc::new(RawPassthrough::new(view.clone())),
        checkpoints.clone(),
        ConsumerConfig::default().with_flush_interval(Duration::from_millis(200)),
    )
    .with_fatal_handler(Arc::new(PropagateError))
    .start()
    .await
    .expect("Failed to start");

    let mut progress = handle.watch_progress();
    tokio::time::timeout(Duration::from_secs(30), async {
        while progress.borrow_and_update().last_committed != Some(19) {
            progress.changed().await.unwrap();
        }
    })
    .await
    .expect("checkpoint never reached the last offset");

    let report = handle.stop().await.unwrap();
    assert_eq!(report.final_checkpoint, Some(19));
    assert_eq!(checkpoints.get(&scope).await.unwrap(), Some(19));
    assert_eq!(view.get(b"p-7").await.unwrap(), Some(b"value-7".to_vec()));
}

#[tokio::test]
#[ignore] // Requires Kafka and Redis running
async fn test_restart_resumes_after_checkpoint() {
    let topic = unique("viewsync-resume");
    let prefix = format!("{}:", unique("it"));
    produce(&topic, 10).await;

    let view = redis(&prefix).await;
    let checkpoints = Arc::new(RedisCheckpointStore::with_connection(
        view.connection(),
        prefix.clone(),
    ));
    let scope = CheckpointScope::new("details", &topic, 0);
    checkpoints.set(&scope, 4).await.unwrap();

    let handle = ViewRunner::new(
        scope.clone(),
        connector(),
        Arc::new(RawPassthrough::new(view.clone())),
        checkpoints.clone(),
        ConsumerConfig::default().with_flush_interval(Duration::from_millis(200)),
    )
    .with_fatal_handler(Arc::new(PropagateError))
    .start()
    .await
    .expect("Failed to start");

    let mut progress = handle.watch_progress();
    tokio::time::timeout(Duration::from_secs(30), async {
        while progress.borrow_and_update().highest_seen != Some(9) {
            progress.changed().await.unwrap();
        }
    })
    .await
    .expect("consumer never saw the last offset");

    let report = handle.stop().await.unwrap();
    assert_eq!(report.final_checkpoint, Some(9));
    assert_eq!(report.messages_dispatched, 5);
    assert_eq!(view.get(b"p-2").await.unwrap(), None);
    assert_eq!(view.get(b"p-5").await.unwrap(), Some(b"value-5".to_vec()));
}
