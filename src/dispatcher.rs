//! Event Dispatcher: in-process fan-out of normalized events to registered
//! handlers, with error isolation and a replay mode.
//!
//! Handlers are registered explicitly through a token-returning API rather
//! than discovered via decorator/annotation scanning, so registration and
//! teardown are both ordinary function calls a host can reason about.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{trace, warn};

use crate::model::NormalizedEventType;

/// A payload handed to a handler. Carries enough of the normalized event for
/// handlers to act on without re-deriving it from the transaction.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub transaction_id: uuid::Uuid,
    pub event_type: NormalizedEventType,
    pub provider: String,
    pub amount: i64,
    pub currency: String,
    pub metadata: crate::model::MetadataMap,
    pub is_replay: bool,
}

#[async_trait]
pub trait EventHandler: std::fmt::Debug + Send + Sync {
    /// Stable name recorded in DispatchLog::handler_name.
    fn name(&self) -> &str;

    async fn handle(&self, event: &DispatchEvent) -> Result<(), String>;
}

/// Outcome of one handler invocation, already folded into the
/// success/failed/skipped vocabulary of `DispatchStatus`.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub handler_name: String,
    pub status: crate::model::DispatchStatus,
    pub error_message: Option<String>,
}

/// Opaque registration handle returned by `register`/`register_global`.
/// `unregister` is the explicit, non-reflective teardown mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Debug)]
struct Registration {
    token: SubscriptionToken,
    handler: Arc<dyn EventHandler>,
    timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct Registry {
    by_event: HashMap<NormalizedEventType, Vec<Registration>>,
    global: Vec<Registration>,
}

/// In-process fan-out. Registration state is the only piece of shared
/// mutable state the dispatcher owns: mutation (register/unregister) is
/// serialized against dispatch iteration by the `RwLock`.
#[derive(Debug)]
pub struct EventDispatcher {
    registry: RwLock<Registry>,
    next_token: AtomicU64,
    default_handler_timeout: Option<Duration>,
}

impl EventDispatcher {
    pub fn new(default_handler_timeout: Option<Duration>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_token: AtomicU64::new(1),
            default_handler_timeout,
        }
    }

    fn alloc_token(&self) -> SubscriptionToken {
        SubscriptionToken(self.next_token.fetch_add(1, Ordering::SeqCst))
    }

    pub async fn register(
        &self,
        event_type: NormalizedEventType,
        handler: Arc<dyn EventHandler>,
        timeout: Option<Duration>,
    ) -> SubscriptionToken {
        let token = self.alloc_token();
        let mut registry = self.registry.write().await;
        registry
            .by_event
            .entry(event_type)
            .or_default()
            .push(Registration {
                token,
                handler,
                timeout,
            });
        token
    }

    pub async fn register_global(
        &self,
        handler: Arc<dyn EventHandler>,
        timeout: Option<Duration>,
    ) -> SubscriptionToken {
        let token = self.alloc_token();
        let mut registry = self.registry.write().await;
        registry.global.push(Registration {
            token,
            handler,
            timeout,
        });
        token
    }

    pub async fn unregister(&self, token: SubscriptionToken) {
        let mut registry = self.registry.write().await;
        for handlers in registry.by_event.values_mut() {
            handlers.retain(|r| r.token != token);
        }
        registry.global.retain(|r| r.token != token);
    }

    /// Resolves the union of event-specific and global handlers, invokes all
    /// concurrently, collects outcomes with settle semantics (no
    /// short-circuit on error). Errors are never propagated here; the caller
    /// (the pipeline or service) is responsible for turning each outcome
    /// into a DispatchLog row and, on error, the `on_dispatch_result` hook.
    pub async fn dispatch(&self, event: &DispatchEvent) -> Vec<HandlerOutcome> {
        let registry = self.registry.read().await;
        let mut targets: Vec<&Registration> = registry
            .by_event
            .get(&event.event_type)
            .into_iter()
            .flatten()
            .collect();
        targets.extend(registry.global.iter());

        if targets.is_empty() {
            trace!(?event.event_type, "no handlers registered");
            return Vec::new();
        }

        let futures = targets.into_iter().map(|reg| {
            let handler = Arc::clone(&reg.handler);
            let timeout = reg.timeout.or(self.default_handler_timeout);
            async move { invoke_one(handler, event, timeout).await }
        });

        join_all(futures).await
    }
}

/// A namespaced view over a shared `EventDispatcher`. Registration and
/// dispatch delegate straight through to the underlying dispatcher — the
/// closed `NormalizedEventType` set leaves no per-namespace routing to do —
/// but every outcome's `handler_name` is prefixed with the namespace so a
/// multi-tenant host can tell DispatchLog rows from different scopes apart
/// without standing up a second registry.
#[derive(Debug, Clone)]
pub struct ScopedDispatcher {
    namespace: String,
    inner: Arc<EventDispatcher>,
}

impl ScopedDispatcher {
    pub fn new(namespace: impl Into<String>, inner: Arc<EventDispatcher>) -> Self {
        Self {
            namespace: namespace.into(),
            inner,
        }
    }

    pub async fn dispatch(&self, event: &DispatchEvent) -> Vec<HandlerOutcome> {
        self.inner
            .dispatch(event)
            .await
            .into_iter()
            .map(|mut outcome| {
                outcome.handler_name = format!("{}:{}", self.namespace, outcome.handler_name);
                outcome
            })
            .collect()
    }
}

async fn invoke_one(
    handler: Arc<dyn EventHandler>,
    event: &DispatchEvent,
    timeout: Option<Duration>,
) -> HandlerOutcome {
    let name = handler.name().to_string();
    let invocation = handler.handle(event);

    let result = match timeout {
        Some(d) => match tokio::time::timeout(d, invocation).await {
            Ok(r) => r,
            Err(_) => {
                warn!(handler = %name, "handler timed out");
                return HandlerOutcome {
                    handler_name: name,
                    status: crate::model::DispatchStatus::Failed,
                    error_message: Some("handler timed out".to_string()),
                };
            }
        },
        None => invocation.await,
    };

    match result {
        Ok(()) => HandlerOutcome {
            handler_name: name,
            status: crate::model::DispatchStatus::Success,
            error_message: None,
        },
        Err(e) => {
            warn!(handler = %name, error = %e, "handler failed");
            HandlerOutcome {
                handler_name: name,
                status: crate::model::DispatchStatus::Failed,
                error_message: Some(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct CountingHandler {
        name: String,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, _event: &DispatchEvent) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn event() -> DispatchEvent {
        DispatchEvent {
            transaction_id: uuid::Uuid::new_v4(),
            event_type: NormalizedEventType::PaymentSuccessful,
            provider: "mock".to_string(),
            amount: 100,
            currency: "NGN".to_string(),
            metadata: crate::model::MetadataMap::new(),
            is_replay: false,
        }
    }

    #[tokio::test]
    async fn dispatch_fans_out_to_specific_and_global_handlers() {
        let dispatcher = EventDispatcher::new(None);
        let calls = Arc::new(AtomicUsize::new(0));

        dispatcher
            .register(
                NormalizedEventType::PaymentSuccessful,
                Arc::new(CountingHandler {
                    name: "specific".to_string(),
                    calls: Arc::clone(&calls),
                    fail: false,
                }),
                None,
            )
            .await;
        dispatcher
            .register_global(
                Arc::new(CountingHandler {
                    name: "global".to_string(),
                    calls: Arc::clone(&calls),
                    fail: false,
                }),
                None,
            )
            .await;

        let outcomes = dispatcher.dispatch(&event()).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(outcomes
            .iter()
            .all(|o| o.status == crate::model::DispatchStatus::Success));
    }

    #[tokio::test]
    async fn one_handler_failing_does_not_cancel_peers() {
        let dispatcher = EventDispatcher::new(None);
        let calls = Arc::new(AtomicUsize::new(0));

        dispatcher
            .register_global(
                Arc::new(CountingHandler {
                    name: "ok".to_string(),
                    calls: Arc::clone(&calls),
                    fail: false,
                }),
                None,
            )
            .await;
        dispatcher
            .register_global(
                Arc::new(CountingHandler {
                    name: "bad".to_string(),
                    calls: Arc::clone(&calls),
                    fail: true,
                }),
                None,
            )
            .await;

        let outcomes = dispatcher.dispatch(&event()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let ok = outcomes
            .iter()
            .find(|o| o.handler_name == "ok")
            .unwrap();
        let bad = outcomes
            .iter()
            .find(|o| o.handler_name == "bad")
            .unwrap();
        assert_eq!(ok.status, crate::model::DispatchStatus::Success);
        assert_eq!(bad.status, crate::model::DispatchStatus::Failed);
    }

    #[tokio::test]
    async fn unregister_removes_handler_from_future_dispatches() {
        let dispatcher = EventDispatcher::new(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let token = dispatcher
            .register_global(
                Arc::new(CountingHandler {
                    name: "temp".to_string(),
                    calls: Arc::clone(&calls),
                    fail: false,
                }),
                None,
            )
            .await;

        dispatcher.dispatch(&event()).await;
        dispatcher.unregister(token).await;
        dispatcher.dispatch(&event()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_timeout_is_recorded_as_failed() {
        #[derive(Debug)]
        struct SlowHandler;

        #[async_trait]
        impl EventHandler for SlowHandler {
            fn name(&self) -> &str {
                "slow"
            }

            async fn handle(&self, _event: &DispatchEvent) -> Result<(), String> {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }
        }

        let dispatcher = EventDispatcher::new(None);
        dispatcher
            .register_global(Arc::new(SlowHandler), Some(Duration::from_millis(1)))
            .await;

        let outcomes = dispatcher.dispatch(&event()).await;
        assert_eq!(outcomes[0].status, crate::model::DispatchStatus::Failed);
        assert_eq!(outcomes[0].error_message.as_deref(), Some("handler timed out"));
    }
}
