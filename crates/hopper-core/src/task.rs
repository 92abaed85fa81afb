//! Execution Task - one handler invocation end-to-end
//!
//! A task waits for its queue's admission token, runs the handler inside a
//! tracing span, contains any failure, and acknowledges the message only when
//! the handler succeeded. Nothing that goes wrong here leaves the task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use hopper_broker::BrokerConnector;
use hopper_types::Message;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info_span, warn, Instrument, Span};

use crate::gate::{AdmissionGate, InFlightGuard};
use crate::registry::HandlerFunc;

/// Outcome of a task that did not complete successfully
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The handler returned an error
    #[error("handler error: {0}")]
    Handler(#[source] anyhow::Error),

    /// The handler panicked
    #[error("panic: {0}")]
    FaultRecovered(String),

    /// Shutdown began before the handler could start
    #[error("declined: worker is shutting down")]
    PostShutdownCancelled,

    /// The handler succeeded but the acknowledgement was refused
    #[error("acknowledgement failed: {0}")]
    Ack(#[source] hopper_types::Error),
}

/// Everything one spawned task needs
pub(crate) struct ExecutionTask {
    pub message: Message,
    pub handler: HandlerFunc,
    pub gate: AdmissionGate,
    /// Root scope shared by every task of the worker
    pub scope: CancellationToken,
    pub broker: Arc<dyn BrokerConnector>,
    /// Broker URL with credentials masked
    pub broker_endpoint: Arc<str>,
    pub auto_ack: bool,
    /// Held for the whole task, released on drop
    pub in_flight: InFlightGuard,
}

impl ExecutionTask {
    /// Run the task to completion
    pub(crate) async fn run(self) -> Result<(), TaskError> {
        let span = info_span!(
            "queue_consumer",
            broker = %self.broker_endpoint,
            origin = %self.message.origin,
            routing_key = %self.message.routing_key,
            message_id = %self.message.id,
            error = field::Empty,
        );

        let ExecutionTask {
            message,
            handler,
            gate,
            scope,
            broker,
            auto_ack,
            in_flight,
            ..
        } = self;

        async move {
            // Dropped last: the token goes back before the task stops counting.
            let _in_flight = in_flight;

            let Some(_permit) = admit(&gate, &scope).await else {
                debug!("Task declined after shutdown");
                return Err(TaskError::PostShutdownCancelled);
            };

            let result = handle(&message, handler, &scope, broker.as_ref(), auto_ack).await;
            if let Err(err) = &result {
                Span::current().record("error", field::display(err));
                error!(error = %err, "Queue handler failed");
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Wait for an admission token unless the root scope is cancelled first
async fn admit(gate: &AdmissionGate, scope: &CancellationToken) -> Option<OwnedSemaphorePermit> {
    let permit = tokio::select! {
        biased;
        _ = scope.cancelled() => None,
        permit = gate.acquire() => permit,
    };

    if scope.is_cancelled() {
        return None;
    }
    permit
}

async fn handle(
    message: &Message,
    handler: HandlerFunc,
    scope: &CancellationToken,
    broker: &dyn BrokerConnector,
    auto_ack: bool,
) -> Result<(), TaskError> {
    debug!(
        headers = ?message.headers,
        body = %String::from_utf8_lossy(&message.body),
        "Message received"
    );

    let invocation = {
        let body = message.body.clone();
        let scope = scope.child_token();
        // The handler is called inside the async block so a panic while
        // building its future is caught too.
        async move { handler(scope, body).await }
    };

    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(TaskError::Handler(err)),
        Err(panic) => return Err(TaskError::FaultRecovered(panic_message(panic.as_ref()))),
    }

    if !auto_ack {
        broker.ack(message).await.map_err(|err| {
            warn!(error = %err, "Failed to acknowledge message");
            TaskError::Ack(err)
        })?;
    }

    debug!("Message handled");
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::InFlightCounter;
    use crate::registry::handler_fn;
    use futures::StreamExt;
    use hopper_broker::{MemoryBroker, Publisher};
    use hopper_types::WorkerKind;

    async fn delivered(broker: &MemoryBroker, routing_key: &str) -> Message {
        let handle = broker.configuration(WorkerKind::RabbitMq).unwrap();
        broker
            .publish(Message::new(routing_key, "payload").with_origin("test"))
            .await
            .unwrap();
        let mut consumer = broker.open_consumer(&handle, routing_key, false).await.unwrap();
        consumer.next().await.unwrap()
    }

    fn task(
        broker: Arc<MemoryBroker>,
        message: Message,
        handler: HandlerFunc,
        scope: CancellationToken,
        counter: &Arc<InFlightCounter>,
        auto_ack: bool,
    ) -> ExecutionTask {
        ExecutionTask {
            message,
            handler,
            gate: AdmissionGate::new(1),
            scope,
            broker,
            broker_endpoint: Arc::from("memory://localhost"),
            auto_ack,
            in_flight: counter.enter(),
        }
    }

    #[tokio::test]
    async fn test_success_acks_once() {
        let broker = Arc::new(MemoryBroker::default().with_worker(WorkerKind::RabbitMq));
        let message = delivered(&broker, "orders").await;
        let counter = InFlightCounter::new();

        let handler = handler_fn(|_scope, body| async move {
            assert_eq!(&body[..], b"payload");
            Ok(())
        });
        let result = task(
            broker.clone(),
            message,
            handler,
            CancellationToken::new(),
            &counter,
            false,
        )
        .run()
        .await;

        assert!(result.is_ok());
        assert_eq!(counter.get(), 0);
        let stats = broker.stats("orders").unwrap();
        assert_eq!(stats.acked_count, 1);
        assert_eq!(stats.in_flight_count, 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_not_acked() {
        let broker = Arc::new(MemoryBroker::default().with_worker(WorkerKind::RabbitMq));
        let message = delivered(&broker, "orders").await;
        let counter = InFlightCounter::new();

        let handler = handler_fn(|_scope, _body| async { anyhow::bail!("invalid order") });
        let result = task(
            broker.clone(),
            message,
            handler,
            CancellationToken::new(),
            &counter,
            false,
        )
        .run()
        .await;

        assert!(matches!(result, Err(TaskError::Handler(_))));
        assert_eq!(counter.get(), 0);
        let stats = broker.stats("orders").unwrap();
        assert_eq!(stats.acked_count, 0);
        assert_eq!(stats.in_flight_count, 1);
    }

    #[tokio::test]
    async fn test_panic_is_recovered_and_not_acked() {
        let broker = Arc::new(MemoryBroker::default().with_worker(WorkerKind::RabbitMq));
        let message = delivered(&broker, "orders").await;
        let counter = InFlightCounter::new();

        let handler = handler_fn(|_scope, _body| async { panic!("handler exploded") });
        let gate = AdmissionGate::new(1);
        let mut execution = task(
            broker.clone(),
            message,
            handler,
            CancellationToken::new(),
            &counter,
            false,
        );
        execution.gate = gate.clone();

        match execution.run().await {
            Err(TaskError::FaultRecovered(msg)) => assert_eq!(msg, "handler exploded"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(gate.in_use(), 0);
        assert_eq!(counter.get(), 0);
        assert_eq!(broker.stats("orders").unwrap().acked_count, 0);
    }

    #[tokio::test]
    async fn test_cancelled_scope_declines_without_running() {
        let broker = Arc::new(MemoryBroker::default().with_worker(WorkerKind::RabbitMq));
        let message = delivered(&broker, "orders").await;
        let counter = InFlightCounter::new();
        let scope = CancellationToken::new();
        scope.cancel();

        let handler = handler_fn(|_scope, _body| async { panic!("must not run") });
        let result = task(broker.clone(), message, handler, scope, &counter, false)
            .run()
            .await;

        assert!(matches!(result, Err(TaskError::PostShutdownCancelled)));
        assert_eq!(counter.get(), 0);
    }

    #[tokio::test]
    async fn test_auto_ack_skips_acknowledgement() {
        let broker = Arc::new(MemoryBroker::default().with_worker(WorkerKind::RabbitMq));
        let message = delivered(&broker, "orders").await;
        let counter = InFlightCounter::new();

        let handler = handler_fn(|_scope, _body| async { Ok(()) });
        let result = task(
            broker.clone(),
            message,
            handler,
            CancellationToken::new(),
            &counter,
            true,
        )
        .run()
        .await;

        assert!(result.is_ok());
        assert_eq!(broker.stats("orders").unwrap().acked_count, 0);
    }
}
