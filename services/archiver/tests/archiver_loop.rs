//! End-to-end behaviour of the archiver loop against in-memory collaborators.

use archiver::event::ReceivedEvent;
use archiver::object_store::JSON_CONTENT_TYPE;
use archiver::{
    ensure_bucket, Archiver, ArchiverStats, Clock, ConfirmationEvent, ConfirmationPublisher,
    DeliveryResult, EventSource, KeyScheme, ObjectKeyGenerator, ObjectStore, PublishError,
    SourceError, StoreError,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Put(String),
    Publish(String),
    Commit(i64),
}

type OpLog = Arc<Mutex<Vec<Op>>>;

/// Clock advancing by a fixed step on every read
struct SteppingClock {
    next: AtomicI64,
    step: i64,
}

impl SteppingClock {
    fn new(start: i64, step: i64) -> Arc<Self> {
        Arc::new(Self {
            next: AtomicI64::new(start),
            step,
        })
    }
}

impl Clock for SteppingClock {
    fn now_millis(&self) -> i64 {
        self.next.fetch_add(self.step, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
}

#[derive(Default)]
struct MemoryStore {
    buckets: Mutex<HashSet<String>>,
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    create_calls: AtomicUsize,
    put_calls: AtomicUsize,
    /// 1-based put calls that fail
    failing_puts: HashSet<usize>,
    ops: OpLog,
}

impl MemoryStore {
    fn with_bucket(bucket: &str, ops: OpLog) -> Self {
        let store = Self {
            ops,
            ..Self::default()
        };
        store.buckets.lock().unwrap().insert(bucket.to_string());
        store
    }

    fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        Ok(self.buckets.lock().unwrap().contains(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.buckets.lock().unwrap().insert(bucket.to_string());
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let call = self.put_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_puts.contains(&call) || !self.buckets.lock().unwrap().contains(bucket) {
            return Err(StoreError::Put {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "simulated outage".to_string(),
            });
        }

        self.ops.lock().unwrap().push(Op::Put(key.to_string()));
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}

struct QueueSource {
    queue: Mutex<VecDeque<ReceivedEvent>>,
    committed: Mutex<Vec<i64>>,
    closed: AtomicBool,
    /// Cancelled once the queue drains; the source then waits forever
    cancel_when_drained: Option<CancellationToken>,
    ops: OpLog,
}

impl QueueSource {
    fn new(payloads: &[&str], ops: OpLog) -> Self {
        let queue = payloads
            .iter()
            .enumerate()
            .map(|(offset, payload)| ReceivedEvent {
                topic: "nbs_request".to_string(),
                partition: 0,
                offset: offset as i64,
                payload: Some(payload.as_bytes().to_vec()),
            })
            .collect();

        Self {
            queue: Mutex::new(queue),
            committed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            cancel_when_drained: None,
            ops,
        }
    }
}

#[async_trait]
impl EventSource for QueueSource {
    async fn next_event(&self) -> Result<Option<ReceivedEvent>, SourceError> {
        let next = self.queue.lock().unwrap().pop_front();
        match (next, &self.cancel_when_drained) {
            (Some(event), _) => Ok(Some(event)),
            (None, None) => Ok(None),
            (None, Some(token)) => {
                token.cancel();
                std::future::pending().await
            }
        }
    }

    fn commit(&self, event: &ReceivedEvent) -> Result<(), SourceError> {
        self.ops.lock().unwrap().push(Op::Commit(event.offset));
        self.committed.lock().unwrap().push(event.offset);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<ConfirmationEvent>>,
    flushed: AtomicBool,
    ops: OpLog,
}

#[async_trait]
impl ConfirmationPublisher for RecordingPublisher {
    async fn publish(&self, confirmation: &ConfirmationEvent) -> Result<DeliveryResult, PublishError> {
        let mut published = self.published.lock().unwrap();
        self.ops
            .lock()
            .unwrap()
            .push(Op::Publish(confirmation.object_name.clone()));
        published.push(confirmation.clone());

        Ok(DeliveryResult {
            topic: "analytcs_result".to_string(),
            partition: 0,
            offset: published.len() as i64 - 1,
        })
    }

    fn flush(&self) -> Result<(), PublishError> {
        self.flushed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    source: Arc<QueueSource>,
    store: Arc<MemoryStore>,
    publisher: Arc<RecordingPublisher>,
    ops: OpLog,
    archiver: Archiver,
}

fn harness(source: QueueSource, store: MemoryStore, clock: Arc<dyn Clock>, ops: OpLog) -> Harness {
    let source = Arc::new(source);
    let store = Arc::new(store);
    let publisher = Arc::new(RecordingPublisher {
        ops: ops.clone(),
        ..RecordingPublisher::default()
    });

    let archiver = Archiver::new(
        source.clone(),
        store.clone(),
        publisher.clone(),
        ObjectKeyGenerator::new(clock, KeyScheme::Timestamp),
        "messages",
    );

    Harness {
        source,
        store,
        publisher,
        ops,
        archiver,
    }
}

#[tokio::test]
async fn alice_click_is_archived_and_confirmed() {
    let ops = OpLog::default();
    let h = harness(
        QueueSource::new(&[r#"{"user": "alice", "action": "click"}"#], ops.clone()),
        MemoryStore::with_bucket("messages", ops.clone()),
        SteppingClock::new(1000, 0),
        ops,
    );

    let stats = h.archiver.run(CancellationToken::new()).await;
    assert_eq!(
        stats,
        ArchiverStats {
            received: 1,
            confirmed: 1,
            failed: 0
        }
    );

    let stored = h.store.object("messages", "message_1000.json").unwrap();
    assert_eq!(stored.body, br#"{"user":"alice","action":"click"}"#);
    assert_eq!(stored.content_type, JSON_CONTENT_TYPE);

    let published = h.publisher.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(
        serde_json::to_string(&published[0]).unwrap(),
        r#"{"status":"saved","bucket":"messages","object_name":"message_1000.json","original_message":{"user":"alice","action":"click"}}"#
    );
}

#[tokio::test]
async fn large_numbers_are_archived_verbatim() {
    let payload = r#"{"id":123456789012345678901234567890,"x":2.2250738585072011e-308}"#;
    let ops = OpLog::default();
    let h = harness(
        QueueSource::new(&[payload], ops.clone()),
        MemoryStore::with_bucket("messages", ops.clone()),
        SteppingClock::new(2_000, 0),
        ops,
    );

    let stats = h.archiver.run(CancellationToken::new()).await;
    assert_eq!(stats.confirmed, 1);

    let stored = h.store.object("messages", "message_2000.json").unwrap();
    assert_eq!(stored.body, payload.as_bytes());

    let published = h.publisher.published.lock().unwrap();
    assert_eq!(
        serde_json::to_string(&published[0]).unwrap(),
        format!(
            r#"{{"status":"saved","bucket":"messages","object_name":"message_2000.json","original_message":{}}}"#,
            payload
        )
    );
}

#[tokio::test]
async fn confirmations_reference_stored_copies_of_the_input() {
    let payloads = [
        r#"{"user": "bob", "tags": ["a", "b"], "score": 1.5}"#,
        r#"{"nested": {"deep": {"value": null}}, "unicode": "caffè"}"#,
        r#"{}"#,
        r#"[1, 2, 3]"#,
    ];
    let ops = OpLog::default();
    let h = harness(
        QueueSource::new(&payloads, ops.clone()),
        MemoryStore::with_bucket("messages", ops.clone()),
        SteppingClock::new(5_000, 3),
        ops,
    );

    h.archiver.run(CancellationToken::new()).await;

    let published = h.publisher.published.lock().unwrap();
    assert_eq!(published.len(), payloads.len());

    for (confirmation, payload) in published.iter().zip(payloads) {
        let original: Value = serde_json::from_str(payload).unwrap();
        assert_eq!(confirmation.status, "saved");
        assert_eq!(confirmation.bucket, "messages");
        assert_eq!(confirmation.original_message, original);

        let stored = h
            .store
            .object(&confirmation.bucket, &confirmation.object_name)
            .expect("confirmed object must exist");
        let decoded: Value = serde_json::from_slice(&stored.body).unwrap();
        assert_eq!(decoded, original);
    }
}

#[tokio::test]
async fn keys_are_unique_whatever_the_pacing() {
    let payloads = [r#"{"n": 1}"#, r#"{"n": 2}"#, r#"{"n": 3}"#];

    for step in [0, 1, 2, 50] {
        let ops = OpLog::default();
        let h = harness(
            QueueSource::new(&payloads, ops.clone()),
            MemoryStore::with_bucket("messages", ops.clone()),
            SteppingClock::new(1_700_000_000_000, step),
            ops,
        );

        h.archiver.run(CancellationToken::new()).await;

        let names: HashSet<String> = h
            .publisher
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.object_name.clone())
            .collect();
        assert_eq!(names.len(), payloads.len(), "step {step}ms produced a collision");
    }
}

#[tokio::test]
async fn store_failure_drops_only_the_failing_event() {
    let ops = OpLog::default();
    let store = MemoryStore {
        failing_puts: HashSet::from([2]),
        ..MemoryStore::with_bucket("messages", ops.clone())
    };
    let h = harness(
        QueueSource::new(&[r#"{"n": 1}"#, r#"{"n": 2}"#, r#"{"n": 3}"#], ops.clone()),
        store,
        SteppingClock::new(1000, 10),
        ops,
    );

    let stats = h.archiver.run(CancellationToken::new()).await;
    assert_eq!(
        stats,
        ArchiverStats {
            received: 3,
            confirmed: 2,
            failed: 1
        }
    );

    let originals: Vec<Value> = h
        .publisher
        .published
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.original_message.clone())
        .collect();
    assert_eq!(originals, vec![json!({"n": 1}), json!({"n": 3})]);

    // Failed event is neither retried nor committed
    assert_eq!(h.store.put_calls.load(Ordering::SeqCst), 3);
    assert_eq!(*h.source.committed.lock().unwrap(), vec![0, 2]);
}

#[tokio::test]
async fn storage_happens_before_confirmation_and_commit() {
    let ops = OpLog::default();
    let h = harness(
        QueueSource::new(&[r#"{"n": 1}"#, r#"{"n": 2}"#], ops.clone()),
        MemoryStore::with_bucket("messages", ops.clone()),
        SteppingClock::new(1000, 10),
        ops,
    );

    h.archiver.run(CancellationToken::new()).await;

    assert_eq!(
        *h.ops.lock().unwrap(),
        vec![
            Op::Put("message_1000.json".to_string()),
            Op::Publish("message_1000.json".to_string()),
            Op::Commit(0),
            Op::Put("message_1010.json".to_string()),
            Op::Publish("message_1010.json".to_string()),
            Op::Commit(1),
        ]
    );
}

#[tokio::test]
async fn malformed_payload_is_skipped() {
    let ops = OpLog::default();
    let h = harness(
        QueueSource::new(&["not json", r#"{"ok": true}"#], ops.clone()),
        MemoryStore::with_bucket("messages", ops.clone()),
        SteppingClock::new(1000, 1),
        ops,
    );

    let stats = h.archiver.run(CancellationToken::new()).await;

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.confirmed, 1);
    assert_eq!(h.store.put_calls.load(Ordering::SeqCst), 1);
    assert_eq!(*h.source.committed.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn missing_bucket_is_created_once() {
    let store = MemoryStore::default();

    assert!(assert_ok!(ensure_bucket(&store, "messages").await));
    assert!(assert_ok!(store.bucket_exists("messages").await));

    // Second startup with the bucket present
    assert!(!assert_ok!(ensure_bucket(&store, "messages").await));
    assert_eq!(store.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_closes_source_and_flushes_publisher() {
    let ops = OpLog::default();
    let shutdown = CancellationToken::new();
    let source = QueueSource {
        cancel_when_drained: Some(shutdown.clone()),
        ..QueueSource::new(&[r#"{"n": 1}"#, r#"{"n": 2}"#], ops.clone())
    };
    let h = harness(
        source,
        MemoryStore::with_bucket("messages", ops.clone()),
        SteppingClock::new(1000, 1),
        ops,
    );

    let stats = tokio::time::timeout(std::time::Duration::from_secs(5), h.archiver.run(shutdown))
        .await
        .expect("archiver did not stop on shutdown");

    assert_eq!(stats.confirmed, 2);
    assert!(h.source.closed.load(Ordering::SeqCst));
    assert!(h.publisher.flushed.load(Ordering::SeqCst));
}
