//! Broker connector trait definitions
//!
//! Defines the interface that every broker client must implement to feed a
//! queue worker.

use async_trait::async_trait;
use futures::stream::BoxStream;
use hopper_types::{Message, MessageId, Result, WorkerKind};

/// Receive endpoint for one queue
///
/// The stream ends when the broker stops delivering to this consumer.
pub type ConsumerEndpoint = BoxStream<'static, Message>;

/// Broker configuration for one worker kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerHandle {
    /// Worker kind this configuration belongs to
    pub kind: WorkerKind,
    /// Broker URL, possibly carrying credentials
    pub endpoint: String,
}

/// Broker connector trait - all broker clients implement this
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Configuration for a worker kind, `None` when the broker is not set up for it
    fn configuration(&self, kind: WorkerKind) -> Option<BrokerHandle>;

    /// Open the receive endpoint of a queue
    ///
    /// With `auto_ack` the broker treats every message as acknowledged as
    /// soon as it is delivered, and [`BrokerConnector::ack`] is not called
    /// for it.
    async fn open_consumer(
        &self,
        handle: &BrokerHandle,
        routing_key: &str,
        auto_ack: bool,
    ) -> Result<ConsumerEndpoint>;

    /// Acknowledge a delivered message
    async fn ack(&self, message: &Message) -> Result<()>;

    /// Report whether the connection is usable
    async fn health(&self) -> Result<()>;

    /// Release the connection. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Send capability of a broker
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a message to the queue named by its routing key
    async fn publish(&self, message: Message) -> Result<MessageId>;
}
