//! The archiver loop.
//!
//! Each input event moves through `RECEIVED -> STORED -> CONFIRMED`, or ends in
//! `FAILED` when decoding, storing or publishing goes wrong. Failed events are
//! logged and skipped; they are never retried. The consumer offset is committed
//! only once an event reaches `CONFIRMED`.

use crate::event::{ConfirmationEvent, DecodeError, ReceivedEvent};
use crate::kafka_consumer::EventSource;
use crate::object_key::ObjectKeyGenerator;
use crate::object_store::{ObjectStore, StoreError, JSON_CONTENT_TYPE};
use crate::producer::{ConfirmationPublisher, DeliveryResult, PublishError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Why a single event could not be archived
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to decode event: {0}")]
    Decode(#[from] DecodeError),

    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl ArchiveError {
    pub fn stage(&self) -> FailureStage {
        match self {
            ArchiveError::Decode(_) => FailureStage::Decode,
            ArchiveError::Encode(_) => FailureStage::Encode,
            ArchiveError::Store(_) => FailureStage::Store,
            ArchiveError::Publish(_) => FailureStage::Publish,
        }
    }
}

/// Step at which an event failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Decode,
    Encode,
    Store,
    Publish,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Decode => "decode",
            FailureStage::Encode => "encode",
            FailureStage::Store => "store",
            FailureStage::Publish => "publish",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one processed event
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Stored and confirmed
    Confirmed {
        object_name: String,
        delivery: DeliveryResult,
    },
    /// Dropped after a logged failure
    Failed { stage: FailureStage, error: String },
}

impl EventOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, EventOutcome::Confirmed { .. })
    }
}

/// Counters for a run of the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiverStats {
    pub received: u64,
    pub confirmed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    confirmed: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ArchiverStats {
        ArchiverStats {
            received: self.received.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Consumes request events, archives them and publishes confirmations
pub struct Archiver {
    source: Arc<dyn EventSource>,
    store: Arc<dyn ObjectStore>,
    publisher: Arc<dyn ConfirmationPublisher>,
    keys: ObjectKeyGenerator,
    bucket: String,
    counters: Counters,
}

impl Archiver {
    pub fn new(
        source: Arc<dyn EventSource>,
        store: Arc<dyn ObjectStore>,
        publisher: Arc<dyn ConfirmationPublisher>,
        keys: ObjectKeyGenerator,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            publisher,
            keys,
            bucket: bucket.into(),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> ArchiverStats {
        self.counters.snapshot()
    }

    /// Drain the source until it is exhausted or `shutdown` fires.
    ///
    /// Shutdown is observed between events only. On exit the source is closed
    /// and the publisher flushed.
    pub async fn run(&self, shutdown: CancellationToken) -> ArchiverStats {
        info!(bucket = %self.bucket, key_scheme = ?self.keys.scheme(), "Starting archiver loop");

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, leaving archiver loop");
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, leaving archiver loop");
                    break;
                }
                next = self.source.next_event() => next,
            };

            match next {
                Ok(Some(event)) => {
                    self.process_event(&event).await;
                }
                Ok(None) => {
                    info!("Event source exhausted");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("archiver.kafka.errors").increment(1);
                }
            }
        }

        self.source.close();
        if let Err(e) = self.publisher.flush() {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }

        let stats = self.counters.snapshot();
        info!(
            received = stats.received,
            confirmed = stats.confirmed,
            failed = stats.failed,
            "Archiver loop stopped"
        );
        stats
    }

    /// Archive one event, publish its confirmation and commit its offset.
    ///
    /// Never fails: errors end the event in [`EventOutcome::Failed`].
    #[instrument(skip(self, event), fields(topic = %event.topic, partition = event.partition, offset = event.offset))]
    pub async fn process_event(&self, event: &ReceivedEvent) -> EventOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("archiver.events.received").increment(1);

        match self.archive(event).await {
            Ok((object_name, delivery)) => {
                self.counters.confirmed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("archiver.events.confirmed").increment(1);

                if let Err(e) = self.source.commit(event) {
                    warn!(error = %e, object_name = %object_name, "Failed to commit offset");
                }

                EventOutcome::Confirmed {
                    object_name,
                    delivery,
                }
            }
            Err(e) => {
                let stage = e.stage();
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("archiver.events.failed", "stage" => stage.as_str()).increment(1);

                error!(
                    stage = %stage,
                    error = %e,
                    payload = %event.payload_lossy(),
                    "Failed to archive event"
                );

                EventOutcome::Failed {
                    stage,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn archive(&self, event: &ReceivedEvent) -> Result<(String, DeliveryResult), ArchiveError> {
        let message = event.decode()?;
        info!(message = %message, "Received event");

        let object_name = self.keys.next_key();
        let body = serde_json::to_vec(&message).map_err(ArchiveError::Encode)?;
        let size_bytes = body.len();

        let started = Instant::now();
        self.store
            .put_object(&self.bucket, &object_name, body, JSON_CONTENT_TYPE)
            .await?;
        metrics::histogram!("archiver.store.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        metrics::counter!("archiver.bytes.stored").increment(size_bytes as u64);

        info!(
            bucket = %self.bucket,
            object_name = %object_name,
            size_bytes,
            "Event stored"
        );

        let confirmation = ConfirmationEvent::saved(&self.bucket, &object_name, message);
        let delivery = self.publisher.publish(&confirmation).await?;

        info!(
            topic = %delivery.topic,
            object_name = %object_name,
            "Confirmation published"
        );
        debug!(partition = delivery.partition, offset = delivery.offset, "Confirmation delivered");

        Ok((object_name, delivery))
    }
}
