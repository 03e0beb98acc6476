use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Unique identifier for a message held by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generates a new random UUID v4-based MessageId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery lifecycle of a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeliveryStatus {
    /// Waiting for a consumer (possibly not yet visible, see `Envelope::visible_at`).
    Pending,
    /// Claimed by a consumer; accompanied by `lease_expires`.
    InFlight,
    /// Processed and acknowledged.
    Acked,
    /// Gave up after too many failed deliveries.
    DeadLettered { error: String },
}

/// A message plus its delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub body: serde_json::Value,
    pub status: DeliveryStatus,
    /// How many times the message has been handed to a consumer.
    pub delivery_count: u32,
    pub created_at: u64,
    /// The message is invisible to consumers before this timestamp (ms).
    pub visible_at: u64,
    /// If `now > lease_expires` while InFlight, the consumer is presumed dead.
    pub lease_expires: Option<u64>,
    pub finished_at: Option<u64>,
    pub last_error: Option<String>,
}

impl Envelope {
    pub fn is_available(&self, now: u64) -> bool {
        match self.status {
            DeliveryStatus::Pending => self.visible_at <= now,
            DeliveryStatus::InFlight => self.lease_expires.map(|lease| now > lease).unwrap_or(false),
            _ => false,
        }
    }

    /// Deserializes the body into a concrete message type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Subscription filter: an exact topic, or a prefix ending in `*`
/// (`integration.result.*` matches `integration.result.aave`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern(String);

impl TopicPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => topic.len() > prefix.len() && topic.starts_with(prefix),
            None => self.0 == topic,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Message counts per delivery state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub acked: usize,
    pub dead_lettered: usize,
}
