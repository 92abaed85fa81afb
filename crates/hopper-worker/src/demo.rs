//! Sample modules served by the worker process

use std::sync::Arc;
use std::time::Duration;

use hopper_core::{HandlerGroup, Module, WorkerHandler};
use hopper_types::WorkerKind;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct Order {
    id: String,
    #[serde(default)]
    amount: f64,
}

/// Consumes `orders` one at a time unless configured otherwise
pub struct OrdersModule;

impl WorkerHandler for OrdersModule {
    fn mount_handlers(&self, group: &mut HandlerGroup) {
        group.add("orders", |scope, body| async move {
            let order: Order = serde_json::from_slice(&body)?;

            tokio::select! {
                _ = scope.cancelled() => anyhow::bail!("order {} interrupted by shutdown", order.id),
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }

            info!(order_id = %order.id, amount = order.amount, "Order processed");
            Ok::<_, anyhow::Error>(())
        });
    }
}

impl Module for OrdersModule {
    fn name(&self) -> &str {
        "orders"
    }

    fn worker_handler(&self, kind: WorkerKind) -> Option<&dyn WorkerHandler> {
        match kind {
            WorkerKind::RabbitMq | WorkerKind::Kafka => Some(self),
            WorkerKind::Redis => None,
        }
    }
}

/// Consumes `emails`
pub struct NotificationsModule;

impl WorkerHandler for NotificationsModule {
    fn mount_handlers(&self, group: &mut HandlerGroup) {
        group.add("emails", |_scope, body| async move {
            let recipient = String::from_utf8_lossy(&body);
            if recipient.trim().is_empty() {
                anyhow::bail!("email without recipient");
            }
            info!(recipient = %recipient, "Email sent");
            Ok(())
        });
    }
}

impl Module for NotificationsModule {
    fn name(&self) -> &str {
        "notifications"
    }

    fn worker_handler(&self, _kind: WorkerKind) -> Option<&dyn WorkerHandler> {
        Some(self)
    }
}

pub fn modules() -> Vec<Arc<dyn Module>> {
    vec![Arc::new(OrdersModule), Arc::new(NotificationsModule)]
}
