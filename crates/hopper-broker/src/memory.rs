//! In-memory broker
//!
//! Fast, non-persistent broker for development and testing.
//! All data is lost when the process exits.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use hopper_types::{Error, Message, MessageId, MessageStatus, QueueStats, Result, WorkerKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::traits::{BrokerConnector, BrokerHandle, ConsumerEndpoint, Publisher};

const DEFAULT_ENDPOINT: &str = "memory://localhost";

/// Internal queue data structure
struct QueueData {
    /// Producer side, dropped when the broker closes
    sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Consumer side, taken by the single consumer of the queue
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    /// Messages delivered but not acked, empty for auto-ack consumers
    in_flight: DashMap<MessageId, Message>,
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
}

impl QueueData {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            in_flight: DashMap::new(),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            acked: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            published_count: self.published.load(Ordering::Relaxed),
            delivered_count: self.delivered.load(Ordering::Relaxed),
            in_flight_count: self.in_flight.len() as u64,
            acked_count: self.acked.load(Ordering::Relaxed),
        }
    }
}

/// In-memory broker implementation
///
/// Queues are declared on first use. Each queue accepts exactly one consumer;
/// messages published before the consumer opens are buffered.
pub struct MemoryBroker {
    /// Broker URL reported to workers
    endpoint: String,
    /// Worker kinds this broker is configured for
    kinds: HashSet<WorkerKind>,
    /// Queues stored by routing key
    queues: DashMap<String, Arc<QueueData>>,
    closed: AtomicBool,
}

impl MemoryBroker {
    /// Create a new in-memory broker with no worker kind configured
    pub fn new(endpoint: impl Into<String>) -> Self {
        info!("Initializing in-memory broker");
        Self {
            endpoint: endpoint.into(),
            kinds: HashSet::new(),
            queues: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Configure the broker for a worker kind
    pub fn with_worker(mut self, kind: WorkerKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    /// Statistics of a queue
    pub fn stats(&self, routing_key: &str) -> Result<QueueStats> {
        self.queues
            .get(routing_key)
            .map(|q| q.stats())
            .ok_or_else(|| Error::QueueNotFound(routing_key.to_string()))
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn declare(&self, routing_key: &str) -> Arc<QueueData> {
        self.queues
            .entry(routing_key.to_string())
            .or_insert_with(|| {
                debug!(queue = %routing_key, "Queue declared");
                Arc::new(QueueData::new())
            })
            .clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    fn configuration(&self, kind: WorkerKind) -> Option<BrokerHandle> {
        self.kinds.contains(&kind).then(|| BrokerHandle {
            kind,
            endpoint: self.endpoint.clone(),
        })
    }

    async fn open_consumer(
        &self,
        handle: &BrokerHandle,
        routing_key: &str,
        auto_ack: bool,
    ) -> Result<ConsumerEndpoint> {
        self.ensure_open()?;

        let queue = self.declare(routing_key);
        let receiver = queue
            .receiver
            .lock()
            .take()
            .ok_or_else(|| Error::QueueSetup {
                routing_key: routing_key.to_string(),
                reason: "queue already has a consumer".to_string(),
            })?;

        info!(queue = %routing_key, worker = %handle.kind, auto_ack, "Consumer opened");

        let stream = UnboundedReceiverStream::new(receiver).map(move |mut message| {
            message.status = MessageStatus::Delivered;
            message.delivery_count += 1;
            queue.delivered.fetch_add(1, Ordering::Relaxed);
            if auto_ack {
                queue.acked.fetch_add(1, Ordering::Relaxed);
            } else {
                queue.in_flight.insert(message.id.clone(), message.clone());
            }
            message
        });

        Ok(stream.boxed())
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        self.ensure_open()?;

        let queue = self
            .queues
            .get(&message.routing_key)
            .map(|q| q.clone())
            .ok_or_else(|| Error::QueueNotFound(message.routing_key.clone()))?;

        match queue.in_flight.remove(&message.id) {
            Some(_) => {
                queue.acked.fetch_add(1, Ordering::Relaxed);
                debug!(
                    queue = %message.routing_key,
                    message_id = %message.id,
                    "Message acknowledged"
                );
                Ok(())
            }
            None => Err(Error::MessageNotFound(message.id.to_string())),
        }
    }

    async fn health(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for queue in self.queues.iter() {
            queue.sender.lock().take();
        }

        info!(queues = self.queues.len(), "In-memory broker closed");
        Ok(())
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, message: Message) -> Result<MessageId> {
        self.ensure_open()?;

        let routing_key = message.routing_key.clone();
        let queue = self.declare(&routing_key);
        let message_id = message.id.clone();

        let sender = queue.sender.lock().clone().ok_or(Error::ConnectionClosed)?;
        sender
            .send(message)
            .map_err(|_| Error::Internal(format!("queue {routing_key} is not accepting messages")))?;
        queue.published.fetch_add(1, Ordering::Relaxed);

        debug!(
            queue = %routing_key,
            message_id = %message_id,
            "Message published"
        );

        Ok(message_id)
    }
}
