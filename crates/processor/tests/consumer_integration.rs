//! End-to-end tests for the checkpointing consumer
//!
//! Everything runs in-process: messages are fed through channel sources,
//! views and checkpoints live in memory.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use viewsync_processor::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use viewsync_processor::error::{CheckpointResult, ErrorClass, ProcessorError, SourceError};
use viewsync_processor::kafka::KafkaError;
use viewsync_processor::materializer::{materializer_fn, Materializer, RawPassthrough, Versioned};
use viewsync_processor::source::{ChannelConnector, ChannelSourceHandle};
use viewsync_processor::state::MemoryViewStore;
use viewsync_processor::{
    CheckpointGuard, CheckpointingConsumer, ConsumerConfig, ConsumerHandle, ConsumerProgress,
    ConsumerState, DecodeFailurePolicy, FieldIndexer, IndexedView, PropagateError, ViewRunner,
};
use viewsync_types::{CheckpointScope, Message, StartOffset, StateChange};

fn scope() -> CheckpointScope {
    CheckpointScope::new("product-details", "products", 0)
}

fn long_interval(capacity: usize) -> ConsumerConfig {
    ConsumerConfig::default()
        .with_flush_capacity(capacity)
        .with_flush_interval(Duration::from_secs(3600))
}

async fn start(
    connector: &Arc<ChannelConnector>,
    checkpoints: Arc<dyn CheckpointStore>,
    materializer: Arc<dyn Materializer>,
    config: ConsumerConfig,
) -> (ConsumerHandle, ChannelSourceHandle) {
    let feed = connector.prepare();
    let handle = ViewRunner::new(scope(), connector.clone(), materializer, checkpoints, config)
        .with_fatal_handler(Arc::new(PropagateError))
        .start()
        .await
        .expect("consumer failed to start");
    (handle, feed)
}

async fn wait_for(handle: &ConsumerHandle, done: impl Fn(&ConsumerProgress) -> bool) {
    let mut progress = handle.watch_progress();
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if done(&progress.borrow_and_update()) {
                return;
            }
            if progress.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .expect("progress condition not reached");
}

fn is_non_decreasing(history: &[i64]) -> bool {
    history.windows(2).all(|w| w[0] <= w[1])
}

/// Completion delay that scrambles completion order
fn jitter(offset: i64) -> Duration {
    Duration::from_millis(((offset * 7) % 13) as u64)
}

#[tokio::test]
async fn test_count_trigger_over_ten_thousand_messages() {
    let connector = Arc::new(ChannelConnector::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let view = MemoryViewStore::new();

    let (handle, feed) = start(
        &connector,
        checkpoints.clone(),
        Arc::new(RawPassthrough::new(view.clone())),
        long_interval(64),
    )
    .await;
    assert_eq!(connector.requested(), vec![StartOffset::Oldest]);

    feed.push_all((1..=10_000).map(|i| Message::upsert(format!("p-{}", i), "v", i)));
    wait_for(&handle, |p| p.highest_seen == Some(10_000) && p.commits >= 156).await;

    let report = handle.stop().await.unwrap();
    assert!(report.cycles_by_count >= 156);
    assert_eq!(report.final_checkpoint, Some(10_000));
    assert_eq!(report.messages_applied, 10_000);

    let history = checkpoints.history(&scope());
    assert!(is_non_decreasing(&history));
    assert_eq!(history.last(), Some(&10_000));
    assert_eq!(view.keys_utf8().len(), 10_000);
}

/// Raw view that counts completed applies per offset
///
/// With `stall_until` set, offsets above the first checkpoint up to that
/// value never finish.
fn counting_view(
    view: &MemoryViewStore,
    applied: &Arc<Mutex<BTreeMap<i64, usize>>>,
    stall_until: Option<i64>,
) -> Arc<dyn Materializer> {
    let view = view.clone();
    let applied = applied.clone();
    Arc::new(materializer_fn(move |msg: Message| {
        let view = view.clone();
        let applied = applied.clone();
        async move {
            if stall_until.map_or(false, |until| msg.offset > 100 && msg.offset <= until) {
                std::future::pending::<()>().await;
            }
            RawPassthrough::new(view).apply(&msg).await?;
            *applied.lock().unwrap().entry(msg.offset).or_insert(0) += 1;
            Ok(())
        }
    }))
}

#[tokio::test]
async fn test_source_failure_then_restart_resumes_from_checkpoint() {
    let connector = Arc::new(ChannelConnector::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let view = MemoryViewStore::new();
    let applied = Arc::new(Mutex::new(BTreeMap::new()));

    // offsets 101..=140 never finish, so 40 messages stay in flight
    let (mut handle, feed) = start(
        &connector,
        checkpoints.clone(),
        counting_view(&view, &applied, Some(140)),
        long_interval(100),
    )
    .await;

    feed.push_all((1..=180).map(|i| Message::upsert(format!("p-{}", i), i.to_string(), i)));
    wait_for(&handle, |p| {
        p.highest_seen == Some(180) && p.commits == 1 && p.in_flight == 40
    })
    .await;
    assert_eq!(checkpoints.current(&scope()), Some(100));
    assert_eq!(applied.lock().unwrap().len(), 140);

    feed.fail(SourceError::Kafka(KafkaError::consumption(
        "broker connection lost",
        "products",
        0,
    )));
    handle.terminated().await;
    assert_eq!(handle.state(), ConsumerState::Failed);

    let err = handle.stop().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::TransportFatal);
    assert_eq!(checkpoints.history(&scope()), vec![100]);
    assert!(!feed.is_closed());

    // restart: the log is replayed from offset 101
    let (handle, feed) = start(
        &connector,
        checkpoints.clone(),
        counting_view(&view, &applied, None),
        long_interval(100),
    )
    .await;
    assert_eq!(connector.requested().last(), Some(&StartOffset::At(101)));

    feed.push_all((101..=180).map(|i| Message::upsert(format!("p-{}", i), i.to_string(), i)));
    wait_for(&handle, |p| p.highest_seen == Some(180)).await;

    let report = handle.stop().await.unwrap();
    assert_eq!(report.final_checkpoint, Some(180));
    assert_eq!(checkpoints.history(&scope()), vec![100, 180]);

    let applied = applied.lock().unwrap().clone();
    assert!((1..=100).all(|offset| applied[&offset] == 1));
    // the stalled messages were applied by the second run only
    assert!((101..=140).all(|offset| applied[&offset] == 1));
    // completed but uncheckpointed messages were applied again
    assert!((141..=180).all(|offset| applied[&offset] == 2));

    assert_eq!(view.keys_utf8().len(), 180);
    assert_eq!(view.value_utf8("p-120"), Some("120".to_string()));
}

/// Log sink shared between the subscriber and the test
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[tokio::test]
async fn test_transport_failure_is_logged_with_offset_context() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .with_ansi(false)
        .with_max_level(tracing::Level::ERROR)
        .finish();
    // current-thread runtime: the control loop is polled on this thread
    let _guard = tracing::subscriber::set_default(subscriber);

    let connector = Arc::new(ChannelConnector::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let view = MemoryViewStore::new();

    let (mut handle, feed) = start(
        &connector,
        checkpoints.clone(),
        Arc::new(RawPassthrough::new(view)),
        long_interval(10),
    )
    .await;

    feed.push_all((1..=35).map(|i| Message::upsert(format!("p-{}", i), "v", i)));
    wait_for(&handle, |p| p.highest_seen == Some(35) && p.last_committed == Some(30)).await;

    feed.fail(SourceError::Kafka(KafkaError::consumption(
        "broker connection lost",
        "products",
        0,
    )));
    handle.terminated().await;
    assert_eq!(handle.state(), ConsumerState::Failed);

    let logged = logs.contents();
    assert!(logged.contains("Consumer failed"), "{}", logged);
    assert!(logged.contains("highest_seen=Some(35)"), "{}", logged);
    assert!(logged.contains("last_committed=Some(30)"), "{}", logged);
    assert!(logged.contains("transport-fatal"), "{}", logged);
}

#[tokio::test]
async fn test_stop_drains_in_flight_before_final_commit() {
    let connector = Arc::new(ChannelConnector::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let applied = Arc::new(AtomicUsize::new(0));

    let slow = {
        let applied = applied.clone();
        materializer_fn(move |msg: Message| {
            let applied = applied.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20) + jitter(msg.offset)).await;
                applied.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let (handle, feed) = start(
        &connector,
        checkpoints.clone(),
        Arc::new(slow),
        ConsumerConfig::default(),
    )
    .await;

    feed.push_all((1..=50).map(|i| Message::upsert("k", "v", i)));
    wait_for(&handle, |p| p.highest_seen == Some(50)).await;
    assert!(applied.load(Ordering::SeqCst) < 50);

    let report = handle.stop().await.unwrap();
    assert_eq!(applied.load(Ordering::SeqCst), 50);
    assert_eq!(report.messages_applied, 50);
    assert_eq!(checkpoints.history(&scope()), vec![50]);
    assert!(feed.is_closed());
}

/// Checkpoint store recording every commit that covers an unapplied offset
struct AuditingStore {
    inner: InMemoryCheckpointStore,
    applied: Arc<Mutex<BTreeSet<i64>>>,
    violations: AtomicUsize,
}

#[async_trait]
impl CheckpointStore for AuditingStore {
    async fn get(&self, scope: &CheckpointScope) -> CheckpointResult<Option<i64>> {
        self.inner.get(scope).await
    }

    async fn set(&self, scope: &CheckpointScope, offset: i64) -> CheckpointResult<()> {
        let covered = {
            let applied = self.applied.lock().unwrap();
            (1..=offset).all(|o| applied.contains(&o))
        };
        if !covered {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.set(scope, offset).await
    }
}

#[tokio::test]
async fn test_checkpoint_never_covers_unapplied_offsets() {
    let connector = Arc::new(ChannelConnector::new());
    let applied = Arc::new(Mutex::new(BTreeSet::new()));
    let audit = Arc::new(AuditingStore {
        inner: InMemoryCheckpointStore::new(),
        applied: applied.clone(),
        violations: AtomicUsize::new(0),
    });

    let recording = {
        let applied = applied.clone();
        materializer_fn(move |msg: Message| {
            let applied = applied.clone();
            async move {
                tokio::time::sleep(jitter(msg.offset)).await;
                applied.lock().unwrap().insert(msg.offset);
                Ok(())
            }
        })
    };

    let config = ConsumerConfig::default()
        .with_flush_capacity(16)
        .with_flush_interval(Duration::from_millis(15));
    let (handle, feed) = start(&connector, audit.clone(), Arc::new(recording), config).await;

    for i in 1..=300 {
        feed.push(Message::upsert(format!("p-{}", i % 37), "v", i));
        if i % 50 == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    wait_for(&handle, |p| p.highest_seen == Some(300)).await;

    let report = handle.stop().await.unwrap();
    assert_eq!(report.final_checkpoint, Some(300));
    assert!(report.cycles_by_count > 0);
    assert_eq!(audit.violations.load(Ordering::SeqCst), 0);
    assert!(is_non_decreasing(&audit.inner.history(&scope())));
}

#[tokio::test]
async fn test_versioned_view_keeps_newest_value_per_key() {
    let connector = Arc::new(ChannelConnector::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let view = MemoryViewStore::new();

    let versioned = Arc::new(Versioned::new(
        "product-details",
        RawPassthrough::new(view.clone()),
        view.clone(),
    ));

    // earlier offsets reach the view later
    let delayed = {
        let versioned = versioned.clone();
        materializer_fn(move |msg: Message| {
            let versioned = versioned.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(60 - msg.offset as u64 * 10)).await;
                versioned.apply(&msg).await
            }
        })
    };

    let (handle, feed) = start(
        &connector,
        checkpoints.clone(),
        Arc::new(delayed),
        ConsumerConfig::default(),
    )
    .await;

    feed.push_all((1..=5).map(|i| Message::upsert("p-1", format!("rev-{}", i), i)));
    wait_for(&handle, |p| p.highest_seen == Some(5)).await;
    handle.stop().await.unwrap();

    assert_eq!(view.value_utf8("p-1"), Some("rev-5".to_string()));
    assert_eq!(view.value_utf8("version:product-details:p-1"), Some("5".to_string()));
}

#[tokio::test]
async fn test_malformed_payload_skipped_when_configured() {
    let connector = Arc::new(ChannelConnector::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let view = MemoryViewStore::new();
    let categories = IndexedView::new(
        "categories",
        view.clone(),
        FieldIndexer::new("category").with_set_prefix("category:"),
    );

    let created = StateChange::created(serde_json::json!({"category": "shoes"}))
        .to_json()
        .unwrap();

    let config = ConsumerConfig::default().with_decode_failure(DecodeFailurePolicy::SkipAndLog);
    let (handle, feed) = start(&connector, checkpoints.clone(), Arc::new(categories), config).await;

    feed.push(Message::upsert("p-1", created, 1));
    feed.push(Message::upsert("p-2", "{not json", 2));
    wait_for(&handle, |p| p.highest_seen == Some(2)).await;

    let report = handle.stop().await.unwrap();
    assert_eq!(report.final_checkpoint, Some(2));
    assert_eq!(report.messages_skipped, 1);
    assert_eq!(view.members_utf8("category:shoes"), vec!["p-1"]);
}

#[tokio::test]
async fn test_malformed_payload_is_fatal_by_default() {
    let connector = Arc::new(ChannelConnector::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let categories = IndexedView::new(
        "categories",
        MemoryViewStore::new(),
        FieldIndexer::new("category"),
    );

    let (mut handle, feed) = start(
        &connector,
        checkpoints.clone(),
        Arc::new(categories),
        ConsumerConfig::default(),
    )
    .await;

    feed.push(Message::upsert("p-2", "{not json", 7));
    handle.terminated().await;

    let err = handle.stop().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::DecodeFatal);
    assert!(matches!(err, ProcessorError::Apply { offset: 7, .. }));
    assert!(checkpoints.history(&scope()).is_empty());
}

#[tokio::test]
async fn test_consumer_rejects_regressing_final_commit() {
    let checkpoints = Arc::new(InMemoryCheckpointStore::with_checkpoint(&scope(), 500));
    let guard = Arc::new(CheckpointGuard::new(checkpoints.clone(), scope()));
    guard.load().await.unwrap();

    // a source positioned before the checkpoint would move it backwards
    let connector = ChannelConnector::new();
    let feed = connector.prepare();
    let source = viewsync_processor::SourceConnector::connect(&connector, &scope(), StartOffset::At(1))
        .await
        .unwrap();

    let handle = CheckpointingConsumer::new(
        scope(),
        source,
        Arc::new(RawPassthrough::new(MemoryViewStore::new())),
        guard,
        ConsumerConfig::default(),
    )
    .unwrap()
    .with_fatal_handler(Arc::new(PropagateError))
    .start();

    feed.push(Message::upsert("p-1", "v", 3));
    wait_for(&handle, |p| p.highest_seen == Some(3)).await;

    let err = handle.stop().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Checkpoint);
    assert_eq!(checkpoints.current(&scope()), Some(500));
}
