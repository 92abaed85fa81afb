//! Handler Registry - routing keys mapped to handler functions
//!
//! Modules declare their queue handlers per worker kind. The registry is built
//! once when a worker is constructed and is read-only afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use hopper_types::{RoutingKey, WorkerKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Future returned by a handler
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Handler function: receives the task scope and the raw message body
pub type HandlerFunc = Arc<dyn Fn(CancellationToken, Bytes) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`HandlerFunc`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFunc
where
    F: Fn(CancellationToken, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |scope, body| Box::pin(f(scope, body)))
}

/// One queue handler declared by a module
#[derive(Clone)]
pub struct HandlerRegistration {
    /// Queue the handler consumes
    pub pattern: RoutingKey,
    pub handler: HandlerFunc,
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Handlers mounted by one module, in declaration order
#[derive(Debug, Default)]
pub struct HandlerGroup {
    pub handlers: Vec<HandlerRegistration>,
}

impl HandlerGroup {
    /// Declare a handler for a queue
    pub fn add<F, Fut>(&mut self, pattern: impl Into<RoutingKey>, f: F)
    where
        F: Fn(CancellationToken, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_func(pattern, handler_fn(f));
    }

    /// Declare an already boxed handler for a queue
    pub fn add_func(&mut self, pattern: impl Into<RoutingKey>, handler: HandlerFunc) {
        self.handlers.push(HandlerRegistration {
            pattern: pattern.into(),
            handler,
        });
    }
}

/// Queue handlers of a module for one worker kind
pub trait WorkerHandler: Send + Sync {
    fn mount_handlers(&self, group: &mut HandlerGroup);
}

/// An application module that may consume queues
pub trait Module: Send + Sync {
    /// Module name, used in logs
    fn name(&self) -> &str;

    /// Handlers this module serves for a worker kind, if any
    fn worker_handler(&self, kind: WorkerKind) -> Option<&dyn WorkerHandler>;
}

/// Routing key to handler mapping for one worker
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<RoutingKey, HandlerFunc>,
    /// Routing keys in first-registration order
    order: Vec<RoutingKey>,
}

impl HandlerRegistry {
    /// Collect the handlers every module declares for `kind`
    ///
    /// A routing key declared twice keeps the last handler.
    pub fn build(kind: WorkerKind, modules: &[Arc<dyn Module>]) -> Self {
        let mut registry = Self::default();

        for module in modules {
            let Some(worker_handler) = module.worker_handler(kind) else {
                continue;
            };

            let mut group = HandlerGroup::default();
            worker_handler.mount_handlers(&mut group);

            for registration in group.handlers {
                info!(
                    worker = %kind,
                    queue = %registration.pattern,
                    module = %module.name(),
                    "Registered queue handler"
                );
                registry.insert(registration.pattern, registration.handler);
            }
        }

        registry
    }

    /// Register a handler, replacing any previous one for the routing key
    pub fn insert(&mut self, routing_key: RoutingKey, handler: HandlerFunc) {
        if self.handlers.insert(routing_key.clone(), handler).is_some() {
            warn!(queue = %routing_key, "Duplicate queue handler, last registration wins");
        } else {
            self.order.push(routing_key);
        }
    }

    /// Handler for a routing key
    pub fn get(&self, routing_key: &str) -> Option<HandlerFunc> {
        self.handlers.get(routing_key).cloned()
    }

    /// Registered routing keys in registration order
    pub fn routing_keys(&self) -> impl Iterator<Item = &RoutingKey> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routing_keys", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OrdersModule {
        calls: Arc<AtomicUsize>,
    }

    impl WorkerHandler for OrdersModule {
        fn mount_handlers(&self, group: &mut HandlerGroup) {
            let calls = self.calls.clone();
            group.add("orders", move |_scope, _body| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            group.add("refunds", |_scope, _body| async { Ok(()) });
        }
    }

    impl Module for OrdersModule {
        fn name(&self) -> &str {
            "orders"
        }

        fn worker_handler(&self, kind: WorkerKind) -> Option<&dyn WorkerHandler> {
            match kind {
                WorkerKind::RabbitMq => Some(self),
                _ => None,
            }
        }
    }

    struct OverrideModule {
        calls: Arc<AtomicUsize>,
    }

    impl WorkerHandler for OverrideModule {
        fn mount_handlers(&self, group: &mut HandlerGroup) {
            let calls = self.calls.clone();
            group.add("orders", move |_scope, _body| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(10, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
    }

    impl Module for OverrideModule {
        fn name(&self) -> &str {
            "override"
        }

        fn worker_handler(&self, _kind: WorkerKind) -> Option<&dyn WorkerHandler> {
            Some(self)
        }
    }

    #[test]
    fn test_build_collects_handlers_for_kind() {
        let calls = Arc::new(AtomicUsize::new(0));
        let modules: Vec<Arc<dyn Module>> = vec![Arc::new(OrdersModule { calls })];

        let registry = HandlerRegistry::build(WorkerKind::RabbitMq, &modules);
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.routing_keys().cloned().collect::<Vec<_>>(),
            vec!["orders".to_string(), "refunds".to_string()]
        );

        let kafka = HandlerRegistry::build(WorkerKind::Kafka, &modules);
        assert!(kafka.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_routing_key_last_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let modules: Vec<Arc<dyn Module>> = vec![
            Arc::new(OrdersModule {
                calls: calls.clone(),
            }),
            Arc::new(OverrideModule {
                calls: calls.clone(),
            }),
        ];

        let registry = HandlerRegistry::build(WorkerKind::RabbitMq, &modules);
        assert_eq!(registry.len(), 2);

        let handler = registry.get("orders").unwrap();
        handler(CancellationToken::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_unknown_routing_key() {
        let registry = HandlerRegistry::default();
        assert!(registry.get("missing").is_none());
    }
}
