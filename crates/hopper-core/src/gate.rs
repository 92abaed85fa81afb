//! Admission control and in-flight accounting
//!
//! [`AdmissionGate`] bounds how many handlers of one queue run at once.
//! [`InFlightCounter`] tracks every task the worker has spawned so shutdown
//! can wait for the last one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Counting concurrency limiter for one routing key
///
/// Holding the returned permit is holding the token; dropping it releases the
/// token on every exit path.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    /// Create a gate with `capacity` tokens (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a token. Returns `None` only if the gate was closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently held
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }
}

/// Process-wide count of tasks spawned and not yet finished
#[derive(Debug, Default)]
pub struct InFlightCounter {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlightCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a task. The count drops again when the guard is dropped.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: Arc::clone(self),
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolve once the count is zero
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register interest before reading the count so a concurrent
            // last leave cannot be missed.
            notified.as_mut().enable();

            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn leave(&self) {
        let previous = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "in-flight counter underflow");
        if previous == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Registration of one in-flight task
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<InFlightCounter>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.leave();
    }
}
