//! Error types for Hopper
//!
//! Defines the startup and broker errors shared by every crate. Errors raised
//! while a single message is handled live next to the execution task and never
//! surface here.

use thiserror::Error;

use crate::worker::WorkerKind;

/// Main error type for Hopper operations
#[derive(Error, Debug)]
pub enum Error {
    /// The broker has no configuration for this worker kind
    #[error("Missing {0} configuration")]
    MissingConfiguration(WorkerKind),

    /// A consumer endpoint could not be opened for a declared queue
    #[error("Failed to open consumer for queue {routing_key}: {reason}")]
    QueueSetup { routing_key: String, reason: String },

    /// Queue not found
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Message not found (unknown or already acknowledged delivery)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// The broker connection has been released
    #[error("Broker connection closed")]
    ConnectionClosed,

    /// The dispatch loop can only be started once
    #[error("Worker {0} is already serving")]
    AlreadyServing(WorkerKind),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error must stop the worker before it serves
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Error::MissingConfiguration(_) | Error::QueueSetup { .. }
        )
    }
}

/// Result type alias for Hopper operations
pub type Result<T> = std::result::Result<T, Error>;
