//! Message types for Hopper
//!
//! Defines the Message delivered to handlers and related types.

use bytes::Bytes;
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a message, used as the delivery tag on acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random MessageId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker-side status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Message is waiting to be consumed
    Pending,
    /// Message has been delivered to a consumer
    Delivered,
}

/// A message received from a queue
///
/// The body is opaque to the dispatcher. Once delivered to a handler the
/// message is never mutated.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,

    /// Queue the message was routed to
    pub routing_key: String,

    /// Message body (raw bytes)
    pub body: Bytes,

    /// Custom headers
    pub headers: HashMap<String, serde_json::Value>,

    /// Where the message came from (exchange, topic, producer name)
    pub origin: String,

    /// Current status
    pub status: MessageStatus,

    /// Number of delivery attempts
    pub delivery_count: u32,
}

impl Message {
    /// Create a new message for a queue with the given body
    pub fn new(routing_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            routing_key: routing_key.into(),
            body: body.into(),
            headers: HashMap::new(),
            origin: String::new(),
            status: MessageStatus::Pending,
            delivery_count: 0,
        }
    }

    /// Set the origin (exchange or producer)
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Add a header
    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get the body as a string (if valid UTF-8)
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}
