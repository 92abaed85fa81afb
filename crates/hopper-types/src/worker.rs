//! Worker types for Hopper
//!
//! Worker kinds, worker configuration and the lifecycle state reported by a
//! running worker.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::queue::QueueConfig;

/// Kind of broker a worker consumes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    RabbitMq,
    Kafka,
    Redis,
}

impl WorkerKind {
    /// Constant label used in registries and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::RabbitMq => "rabbitmq",
            WorkerKind::Kafka => "kafka",
            WorkerKind::Redis => "redis",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rabbitmq" | "rabbit" | "amqp" => Ok(WorkerKind::RabbitMq),
            "kafka" => Ok(WorkerKind::Kafka),
            "redis" => Ok(WorkerKind::Redis),
            other => Err(format!("Unknown worker kind: {other}")),
        }
    }
}

/// Lifecycle of a queue worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Accepting and dispatching messages
    Running,
    /// Intake stopped, waiting for in-flight tasks
    ShuttingDown,
    /// Drained and broker connection released
    Stopped,
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// The broker acknowledges on delivery; the worker never acks
    #[serde(default)]
    pub auto_ack: bool,

    /// Admission capacity for queues without an explicit entry
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Per-queue overrides keyed by routing key
    #[serde(default)]
    pub queues: HashMap<String, QueueConfig>,

    /// How long a graceful shutdown waits for in-flight tasks
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_concurrency() -> usize {
    1
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            auto_ack: false,
            default_concurrency: default_concurrency(),
            queues: HashMap::new(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl WorkerConfig {
    /// Set automatic acknowledgement
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Set the default admission capacity
    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency;
        self
    }

    /// Override the admission capacity of one queue
    pub fn with_queue(mut self, routing_key: impl Into<String>, config: QueueConfig) -> Self {
        self.queues.insert(routing_key.into(), config);
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_secs = timeout.as_secs();
        self
    }

    /// Admission capacity for a queue, never below 1
    pub fn capacity_for(&self, routing_key: &str) -> usize {
        self.queues
            .get(routing_key)
            .map(|q| q.max_concurrency)
            .unwrap_or(self.default_concurrency)
            .max(1)
    }

    /// Shutdown timeout as a Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
