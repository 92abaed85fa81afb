//! Queue types for Hopper
//!
//! Defines per-queue consumer configuration and broker-side statistics.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Identifier correlating a queue to its registered handler
pub type RoutingKey = String;

/// Per-queue consumer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueueConfig {
    /// Maximum number of handler executions running at once for this queue
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    1 // strict per-queue serialization
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl QueueConfig {
    /// Create a queue config with the given admission capacity
    pub fn with_max_concurrency(max_concurrency: usize) -> Self {
        Self { max_concurrency }
    }
}

/// Queue statistics as reported by a broker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueueStats {
    /// Messages published to the queue
    pub published_count: u64,

    /// Messages handed to a consumer
    pub delivered_count: u64,

    /// Messages delivered but not yet acknowledged
    pub in_flight_count: u64,

    /// Messages acknowledged by a consumer
    pub acked_count: u64,
}
