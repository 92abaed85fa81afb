//! Hopper Types - Core domain types for the queue consumer
//!
//! This crate contains all shared types used across Hopper components.

pub mod endpoint;
pub mod error;
pub mod message;
pub mod queue;
pub mod worker;

// Re-export commonly used types
pub use endpoint::mask_password_url;
pub use error::{Error, Result};
pub use message::{Message, MessageId, MessageStatus};
pub use queue::{QueueConfig, QueueStats, RoutingKey};
pub use worker::{WorkerConfig, WorkerKind, WorkerState};
