//! Kafka producer for confirmation events.
//!
//! A publish resolves only once the broker has acknowledged the record, so a
//! returned [`DeliveryResult`] means the confirmation is durably sent.

use crate::config::KafkaConfig;
use crate::event::ConfirmationEvent;
use crate::kafka_consumer::apply_security;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur while publishing confirmations
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    /// Topic the message was delivered to
    pub topic: String,
    /// Partition the message was delivered to
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
}

/// Sink for confirmation events
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfirmationPublisher: Send + Sync {
    /// Publish and wait for the broker acknowledgement
    async fn publish(&self, confirmation: &ConfirmationEvent) -> Result<DeliveryResult, PublishError>;

    /// Flush anything still queued
    fn flush(&self) -> Result<(), PublishError>;
}

/// Confirmation publisher backed by an rdkafka `FutureProducer`
pub struct KafkaConfirmationPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaConfirmationPublisher {
    /// Create a producer for the output topic
    pub fn new(config: &KafkaConfig) -> Result<Self, PublishError> {
        info!(
            "Creating Kafka producer for {}",
            config.bootstrap_servers
        );

        let timeout = config.produce_timeout();

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", config.produce_timeout_ms.to_string());

        apply_security(&mut client_config, config);

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| PublishError::CreationError(e.to_string()))?;

        Ok(Self {
            producer,
            topic: config.output_topic.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl ConfirmationPublisher for KafkaConfirmationPublisher {
    #[instrument(skip(self, confirmation), fields(topic = %self.topic, object_name = %confirmation.object_name))]
    async fn publish(&self, confirmation: &ConfirmationEvent) -> Result<DeliveryResult, PublishError> {
        let payload = serde_json::to_vec(confirmation)
            .map_err(|e| PublishError::SerializationError(e.to_string()))?;

        let record = FutureRecord::to(&self.topic)
            .key(&confirmation.object_name)
            .payload(&payload);

        debug!(
            "Sending confirmation to topic {} (size: {} bytes)",
            self.topic,
            payload.len()
        );

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| PublishError::SendError {
                topic: self.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(
            "Confirmation delivered to partition {} at offset {}",
            partition, offset
        );

        Ok(DeliveryResult {
            topic: self.topic.clone(),
            partition,
            offset,
        })
    }

    fn flush(&self) -> Result<(), PublishError> {
        self.producer
            .flush(Timeout::After(self.timeout))
            .map_err(|_| PublishError::Timeout(self.timeout))
    }
}

impl Drop for KafkaConfirmationPublisher {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}
