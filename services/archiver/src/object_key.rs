use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Source of wall-clock time in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Naming scheme for archived objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScheme {
    /// `message_<epoch-ms>.json`
    #[default]
    Timestamp,
    /// `message_<epoch-ms>_<uuid>.json`, safe across several instances
    TimestampUuid,
}

/// Derives one object key per archived event.
///
/// Timestamps never repeat within a generator: when the clock has not moved
/// past the last issued millisecond, the next millisecond is used instead.
pub struct ObjectKeyGenerator {
    clock: Arc<dyn Clock>,
    scheme: KeyScheme,
    last_millis: AtomicI64,
}

impl ObjectKeyGenerator {
    pub fn new(clock: Arc<dyn Clock>, scheme: KeyScheme) -> Self {
        Self {
            clock,
            scheme,
            last_millis: AtomicI64::new(i64::MIN),
        }
    }

    /// Generator reading the system clock
    pub fn system(scheme: KeyScheme) -> Self {
        Self::new(Arc::new(SystemClock), scheme)
    }

    pub fn scheme(&self) -> KeyScheme {
        self.scheme
    }

    /// Produce the key for the next event
    pub fn next_key(&self) -> String {
        let millis = self.next_millis();
        match self.scheme {
            KeyScheme::Timestamp => format!("message_{millis}.json"),
            KeyScheme::TimestampUuid => format!("message_{millis}_{}.json", Uuid::new_v4()),
        }
    }

    fn next_millis(&self) -> i64 {
        let now = self.clock.now_millis();
        let previous = self
            .last_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(previous.saturating_add(1))
    }
}
