//! Archiver Service
//!
//! Persistence tap for the analytics event pipeline. The service consumes
//! request events from Kafka, writes each payload to an S3-compatible object
//! store under a unique key, and publishes a confirmation that references the
//! stored object.
//!
//! ## Architecture
//!
//! ```text
//! Kafka                     Object Store              Kafka
//! ┌──────────────┐          ┌──────────────┐          ┌──────────────┐
//! │ nbs_request  │          │ messages/    │          │ analytcs_    │
//! │              │          │  message_    │          │   result     │
//! └──────────────┘          │  <ms>.json   │          └──────────────┘
//!        │                  └──────────────┘                 ▲
//!        ▼                         ▲                         │
//! ┌──────────────┐   put object    │     confirmation        │
//! │ Archiver     │─────────────────┘─────────────────────────┘
//! │ Loop         │
//! └──────────────┘
//!        │ commit offset once confirmed
//!        ▼
//! ```
//!
//! Events are processed one at a time. A failure to store or confirm an event
//! is logged and the event is skipped without retry.

pub mod archiver;
pub mod config;
pub mod event;
pub mod kafka_consumer;
pub mod object_key;
pub mod object_store;
pub mod producer;

pub use archiver::{ArchiveError, Archiver, ArchiverStats, EventOutcome, FailureStage};
pub use config::Config;
pub use event::{ConfirmationEvent, InputEvent, ReceivedEvent};
pub use kafka_consumer::{EventSource, KafkaEventSource, SourceError};
pub use object_key::{Clock, KeyScheme, ObjectKeyGenerator, SystemClock};
pub use object_store::{ensure_bucket, ObjectStore, S3ObjectStore, StoreError};
pub use producer::{ConfirmationPublisher, DeliveryResult, KafkaConfirmationPublisher, PublishError};
