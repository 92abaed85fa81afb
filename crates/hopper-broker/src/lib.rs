//! Hopper Broker - Broker connector interface for the queue consumer
//!
//! The dispatcher never speaks a wire protocol itself. It consumes a
//! [`BrokerConnector`] that hands out one receive endpoint per queue and
//! accepts acknowledgements. Currently ships:
//! - In-memory broker (default, for development/testing)

pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports
pub use traits::{BrokerConnector, BrokerHandle, ConsumerEndpoint, Publisher};

#[cfg(feature = "memory")]
pub use memory::MemoryBroker;
