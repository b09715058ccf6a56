use crate::config::KafkaConfig;
use crate::event::ReceivedEvent;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while consuming the input topic
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topic {topic}: {message}")]
    SubscriptionError { topic: String, message: String },

    #[error("Consumer poll error: {0}")]
    PollError(String),

    #[error("Failed to commit offset {offset} on {topic}/{partition}: {message}")]
    CommitError {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },
}

/// Ordered stream of request events with explicit offset commits
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait for the next record. `Ok(None)` means the source is exhausted.
    async fn next_event(&self) -> Result<Option<ReceivedEvent>, SourceError>;

    /// Mark `event` and everything before it on its partition as processed
    fn commit(&self, event: &ReceivedEvent) -> Result<(), SourceError>;

    /// Leave the consumer group and release the session
    fn close(&self);
}

/// Kafka consumer for the input topic
pub struct KafkaEventSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaEventSource {
    /// Create a consumer and subscribe it to the input topic
    pub fn new(config: &KafkaConfig) -> Result<Self, SourceError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        apply_security(&mut client_config, config);

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| SourceError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[&config.input_topic])
            .map_err(|e| SourceError::SubscriptionError {
                topic: config.input_topic.clone(),
                message: e.to_string(),
            })?;

        info!(
            topic = %config.input_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            topic: config.input_topic.clone(),
        })
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn next_event(&self) -> Result<Option<ReceivedEvent>, SourceError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| SourceError::PollError(e.to_string()))?;

        Ok(Some(ReceivedEvent {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
        }))
    }

    fn commit(&self, event: &ReceivedEvent) -> Result<(), SourceError> {
        let commit_error = |message: String| SourceError::CommitError {
            topic: event.topic.clone(),
            partition: event.partition,
            offset: event.offset,
            message,
        };

        // Committed offset is the next one to read
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&event.topic, event.partition, Offset::Offset(event.offset + 1))
            .map_err(|e| commit_error(e.to_string()))?;

        // Sync so the commit lands before the next record is fetched; this
        // blocks the worker for one broker round trip per confirmed event.
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| commit_error(e.to_string()))?;

        debug!(
            topic = %event.topic,
            partition = event.partition,
            offset = event.offset,
            "Committed offset"
        );
        Ok(())
    }

    fn close(&self) {
        info!(topic = %self.topic, "Closing Kafka consumer");
        self.consumer.unsubscribe();
    }
}

/// Configure SSL/SASL on a client from the Kafka settings
pub(crate) fn apply_security(client_config: &mut ClientConfig, config: &KafkaConfig) {
    let sasl = match (&config.sasl_username, &config.sasl_password) {
        (Some(username), Some(password)) => Some((username, password)),
        _ => None,
    };

    let protocol = match (config.ssl_enabled, sasl.is_some()) {
        (true, true) => Some("SASL_SSL"),
        (true, false) => Some("SSL"),
        (false, true) => Some("SASL_PLAINTEXT"),
        (false, false) => None,
    };

    if let Some(protocol) = protocol {
        client_config.set("security.protocol", protocol);
    }

    if config.ssl_enabled {
        if let Some(ref ca_location) = config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }
    }

    if let Some((username, password)) = sasl {
        client_config
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }
}
