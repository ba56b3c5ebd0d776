//! Broker-delivered messages and partition claims

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::consumer::error::ConsumerError;

/// A message as read from a partition claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Broker offset of this message
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Bytes>,
    /// Message payload
    pub payload: Bytes,
    /// Broker timestamp in milliseconds (if present)
    pub timestamp: Option<i64>,
}

impl RawMessage {
    /// Create a message without key or timestamp
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: payload.into(),
            timestamp: None,
        }
    }

    /// Attach a key
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attach a broker timestamp
    pub fn with_timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// One item read from a claim: a message, or a broker error that ends the claim
pub type ClaimItem = Result<RawMessage, ConsumerError>;

/// Assignment of one partition to this consumer for one session
#[derive(Debug)]
pub struct Claim {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<ClaimItem>,
}

impl Claim {
    /// Create a claim fed by `messages`; the claim ends when every sender is dropped
    pub fn new(topic: impl Into<String>, partition: i32, messages: mpsc::Receiver<ClaimItem>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            messages,
        }
    }

    /// Claimed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Claimed partition
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Next item, or `None` once the claim is closed
    pub async fn next(&mut self) -> Option<ClaimItem> {
        self.messages.recv().await
    }
}
