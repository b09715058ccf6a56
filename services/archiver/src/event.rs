use serde::{Deserialize, Serialize};

/// A request event as read off the input topic. Its shape is opaque to the
/// archiver and passed through unmodified.
pub type InputEvent = serde_json::Value;

/// Status carried by every confirmation event
pub const STATUS_SAVED: &str = "saved";

/// A raw record received from the input topic, detached from the client
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    /// Topic the record was read from
    pub topic: String,
    /// Partition the record was read from
    pub partition: i32,
    /// Offset of the record in the partition
    pub offset: i64,
    /// Record value, if any
    pub payload: Option<Vec<u8>>,
}

impl ReceivedEvent {
    /// Decode the payload as a JSON input event
    pub fn decode(&self) -> Result<InputEvent, DecodeError> {
        let payload = self.payload.as_deref().ok_or(DecodeError::EmptyPayload)?;
        serde_json::from_slice(payload).map_err(DecodeError::Json)
    }

    /// Payload rendered for log lines
    pub fn payload_lossy(&self) -> String {
        self.payload
            .as_deref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Message has no payload")]
    EmptyPayload,

    #[error("Payload is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
}

/// Confirmation published once an input event has been archived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationEvent {
    pub status: String,
    pub bucket: String,
    pub object_name: String,
    pub original_message: InputEvent,
}

impl ConfirmationEvent {
    pub fn saved(
        bucket: impl Into<String>,
        object_name: impl Into<String>,
        original_message: InputEvent,
    ) -> Self {
        Self {
            status: STATUS_SAVED.to_string(),
            bucket: bucket.into(),
            object_name: object_name.into(),
            original_message,
        }
    }
}
