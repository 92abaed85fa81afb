//! Hopper Core - Concurrent queue-consumer dispatcher
//!
//! This crate contains the worker that multiplexes every subscribed queue
//! into one dispatch loop:
//! - Handler registry: routing keys declared by modules
//! - Admission gates: per-queue concurrency bounds
//! - Execution tasks: handler invocation, failure containment, acknowledgement
//! - Queue worker: dispatch loop and graceful shutdown

pub mod gate;
pub mod registry;
pub mod task;
pub mod worker;

// Re-exports
pub use gate::{AdmissionGate, InFlightCounter};
pub use registry::{
    handler_fn, HandlerFunc, HandlerGroup, HandlerRegistry, Module, WorkerHandler,
};
pub use task::TaskError;
pub use worker::{QueueWorker, ShutdownError};

// Handlers receive the task scope as a cancellation token
pub use tokio_util::sync::CancellationToken;
