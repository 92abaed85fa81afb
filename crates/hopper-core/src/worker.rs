//! Queue Worker - dispatch loop and shutdown coordination
//!
//! The worker owns one receive endpoint per registered queue. A single loop
//! waits on all of them plus the shutdown signal and spawns an execution task
//! per message without waiting for it.
//!
//! ```text
//! endpoints ──► [StreamMap] ──► dispatch ──► spawn(task) ──► [gate] ──► handler ──► ack
//!                    ▲                                            │
//!   shutdown ────────┘ (biased)                    in-flight ◄────┘ (drop)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hopper_broker::{BrokerConnector, ConsumerEndpoint};
use hopper_types::{
    mask_password_url, Error, Message, Result, RoutingKey, WorkerConfig, WorkerKind, WorkerState,
};
use parking_lot::Mutex;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::gate::{AdmissionGate, InFlightCounter};
use crate::registry::{HandlerRegistry, Module};
use crate::task::ExecutionTask;

/// Shutdown errors
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// The deadline passed with tasks still running; the connection was
    /// released anyway
    #[error("graceful shutdown timed out with {in_flight} task(s) in flight")]
    DeadlineExceeded { in_flight: usize },

    /// Releasing the broker connection failed
    #[error("failed to close broker connection: {0}")]
    Close(#[from] Error),
}

/// Concurrent consumer for every queue registered for one worker kind
pub struct QueueWorker {
    kind: WorkerKind,
    broker: Arc<dyn BrokerConnector>,
    /// Broker URL with credentials masked
    broker_endpoint: Arc<str>,
    config: WorkerConfig,
    registry: HandlerRegistry,
    gates: HashMap<RoutingKey, AdmissionGate>,
    /// Taken by the dispatch loop when it starts
    sources: Mutex<Option<StreamMap<RoutingKey, ConsumerEndpoint>>>,
    /// Scope every task derives from
    root: CancellationToken,
    /// Fired once to stop the dispatch loop
    shutdown_signal: CancellationToken,
    /// Cancelled when the dispatch loop has returned
    loop_exited: CancellationToken,
    in_flight: Arc<InFlightCounter>,
    state: Mutex<WorkerState>,
}

impl QueueWorker {
    /// Create a worker and open a consumer for every registered queue
    ///
    /// Fails before anything is served when the broker has no configuration
    /// for `kind` or when a queue endpoint cannot be opened.
    pub async fn new(
        kind: WorkerKind,
        broker: Arc<dyn BrokerConnector>,
        modules: &[Arc<dyn Module>],
        config: WorkerConfig,
    ) -> Result<Self> {
        let handle = broker
            .configuration(kind)
            .ok_or(Error::MissingConfiguration(kind))?;
        let broker_endpoint: Arc<str> = Arc::from(mask_password_url(&handle.endpoint));

        let registry = HandlerRegistry::build(kind, modules);

        let mut sources = StreamMap::new();
        let mut gates = HashMap::new();
        for routing_key in registry.routing_keys() {
            let endpoint = broker
                .open_consumer(&handle, routing_key, config.auto_ack)
                .await
                .map_err(|err| match err {
                    err @ Error::QueueSetup { .. } => err,
                    other => Error::QueueSetup {
                        routing_key: routing_key.clone(),
                        reason: other.to_string(),
                    },
                })?;

            let capacity = config.capacity_for(routing_key);
            debug!(queue = %routing_key, capacity, "Admission gate created");

            sources.insert(routing_key.clone(), endpoint);
            gates.insert(routing_key.clone(), AdmissionGate::new(capacity));
        }

        if sources.is_empty() {
            warn!(worker = %kind, "No queue provided");
        } else {
            info!(
                worker = %kind,
                queues = sources.len(),
                broker = %broker_endpoint,
                auto_ack = config.auto_ack,
                "Queue consumer ready"
            );
        }

        Ok(Self {
            kind,
            broker,
            broker_endpoint,
            config,
            registry,
            gates,
            sources: Mutex::new(Some(sources)),
            root: CancellationToken::new(),
            shutdown_signal: CancellationToken::new(),
            loop_exited: CancellationToken::new(),
            in_flight: InFlightCounter::new(),
            state: Mutex::new(WorkerState::Running),
        })
    }

    /// Constant worker-kind label
    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Tasks spawned and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    pub fn queue_count(&self) -> usize {
        self.gates.len()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the dispatch loop until shutdown is signalled or every queue
    /// endpoint has closed
    ///
    /// Can only be called once per worker.
    #[instrument(skip(self), fields(worker = %self.kind))]
    pub async fn serve(&self) -> Result<()> {
        let mut sources = self
            .sources
            .lock()
            .take()
            .ok_or(Error::AlreadyServing(self.kind))?;
        let _exited = self.loop_exited.clone().drop_guard();

        info!("Dispatch loop started");

        if sources.is_empty() {
            self.shutdown_signal.cancelled().await;
            info!("Dispatch loop stopped");
            return Ok(());
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_signal.cancelled() => {
                    debug!("Shutdown signal received");
                    break;
                }
                next = sources.next() => match next {
                    Some((routing_key, message)) => self.dispatch(&routing_key, message),
                    None => {
                        warn!("All queue endpoints closed");
                        break;
                    }
                },
            }
        }

        info!("Dispatch loop stopped");
        Ok(())
    }

    /// Spawn the execution task for one message; never waits on it
    fn dispatch(&self, routing_key: &str, message: Message) {
        let (Some(handler), Some(gate)) = (self.registry.get(routing_key), self.gates.get(routing_key))
        else {
            warn!(queue = %routing_key, message_id = %message.id, "No handler for queue, skipping message");
            return;
        };

        debug!(queue = %routing_key, message_id = %message.id, "Dispatching message");

        let task = ExecutionTask {
            message,
            handler,
            gate: gate.clone(),
            scope: self.root.clone(),
            broker: self.broker.clone(),
            broker_endpoint: self.broker_endpoint.clone(),
            auto_ack: self.config.auto_ack,
            in_flight: self.in_flight.enter(),
        };

        tokio::spawn(async move {
            // Outcome is already recorded on the task span
            let _ = task.run().await;
        });
    }

    /// Stop intake, wait for in-flight tasks, release the broker connection
    ///
    /// The first call fires the shutdown signal and cancels the root scope.
    /// Every call waits at most `deadline` for the dispatch loop to return and
    /// for in-flight tasks to finish; when it
    /// expires the connection is released anyway and
    /// [`ShutdownError::DeadlineExceeded`] is returned.
    #[instrument(skip(self), fields(worker = %self.kind))]
    pub async fn shutdown(&self, deadline: Duration) -> std::result::Result<(), ShutdownError> {
        let first = {
            let mut state = self.state.lock();
            let first = *state == WorkerState::Running;
            if first {
                *state = WorkerState::ShuttingDown;
            }
            first
        };

        if first {
            info!("Stopping queue worker");
            self.shutdown_signal.cancel();
            self.root.cancel();

            let running = self.in_flight.get();
            if running != 0 {
                info!(running, "Waiting for in-flight tasks");
            }
        }

        // A loop that already took its sources may still be inside dispatch;
        // draining starts only after it has returned.
        let serving = self.sources.lock().is_none();
        let drained = tokio::time::timeout(deadline, async {
            if serving {
                self.loop_exited.cancelled().await;
            }
            self.in_flight.wait_idle().await;
        })
        .await
        .is_ok();

        let closed = self.broker.close().await;
        *self.state.lock() = WorkerState::Stopped;

        if !drained {
            let in_flight = self.in_flight.get();
            warn!(in_flight, ?deadline, "Shutdown deadline reached, returning with tasks in flight");
            if let Err(err) = closed {
                warn!(error = %err, "Failed to close broker connection");
            }
            return Err(ShutdownError::DeadlineExceeded { in_flight });
        }

        closed?;
        info!("Queue worker stopped");
        Ok(())
    }
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("kind", &self.kind)
            .field("broker", &self.broker_endpoint)
            .field("registry", &self.registry)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
