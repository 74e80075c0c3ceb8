//! Dispatches inbound envelopes to handlers by inner operation code.
//!
//! Each message runs as its own task. The number of in-flight handlers is
//! bounded by a semaphore; the permit is taken before spawning, so a full
//! router stalls the receive loop instead of piling up tasks.

use crate::protocol::{Envelope, Message, OperationCode};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: Envelope, message: Message);
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope, message: Message) {
        (self.0)(envelope, message).await
    }
}

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Envelope, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

pub struct Router {
    handlers: RwLock<HashMap<OperationCode, Arc<dyn Handler>>>,
    permits: Arc<Semaphore>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}

impl Router {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Replaces any handler already registered for `code`.
    pub fn register(&self, code: OperationCode, handler: Arc<dyn Handler>) {
        if self.handlers.write().insert(code, handler).is_some() {
            debug!(%code, "handler replaced");
        }
    }

    pub fn is_registered(&self, code: OperationCode) -> bool {
        self.handlers.read().contains_key(&code)
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Decodes and spawns the handler. Malformed or unroutable messages are
    /// logged and dropped; `None` is returned for them.
    pub async fn dispatch(&self, envelope: Envelope) -> Option<JoinHandle<()>> {
        let message = match envelope.message() {
            Ok(m) => m,
            Err(e) => {
                warn!(from = %envelope.from, error = %e, "dropping malformed message");
                return None;
            }
        };
        let handler = self.handlers.read().get(&message.code).cloned();
        let Some(handler) = handler else {
            warn!(from = %envelope.from, code = %message.code, "no handler for operation");
            return None;
        };
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return None,
        };
        Some(tokio::spawn(async move {
            handler.handle(envelope, message).await;
            drop(permit);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Ecosystem;
    use crate::protocol::{EcosystemOp, StreamCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn envelope_for(code: OperationCode) -> Envelope {
        let msg = Message::new(code, &serde_json::json!({})).unwrap();
        Envelope::send("a", "b", &msg).unwrap()
    }

    #[tokio::test]
    async fn test_dispatches_to_registered_handler() {
        let router = Router::new(4);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        router.register(
            OperationCode::InsertLogs,
            handler_fn(move |_, _| {
                let h = h.clone();
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        router
            .dispatch(envelope_for(OperationCode::InsertLogs))
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drops_unknown_and_malformed() {
        let router = Router::new(4);
        let code = OperationCode::Ecosystem(Ecosystem::Node, EcosystemOp::Save);
        assert!(router.dispatch(envelope_for(code)).await.is_none());

        let garbage = Envelope {
            code: StreamCode::Send,
            node_key: "a".into(),
            from: "a".into(),
            to: "b".into(),
            data: b"not json".to_vec(),
        };
        assert!(router.dispatch(garbage).await.is_none());
    }

    #[tokio::test]
    async fn test_in_flight_bounded_by_permits() {
        let router = Arc::new(Router::new(2));
        let gate = Arc::new(Notify::new());
        let g = gate.clone();
        router.register(
            OperationCode::NodeHeartbeat,
            handler_fn(move |_, _| {
                let g = g.clone();
                async move { g.notified().await }
            }),
        );

        let _a = router.dispatch(envelope_for(OperationCode::NodeHeartbeat)).await.unwrap();
        let _b = router.dispatch(envelope_for(OperationCode::NodeHeartbeat)).await.unwrap();
        assert_eq!(router.available_permits(), 0);

        // third dispatch must wait for a permit
        let r = router.clone();
        let third = tokio::spawn(async move {
            r.dispatch(envelope_for(OperationCode::NodeHeartbeat)).await.is_some()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished());

        gate.notify_waiters();
        let dispatched = tokio::time::timeout(Duration::from_secs(2), third).await.unwrap().unwrap();
        assert!(dispatched);
        gate.notify_waiters();
    }
}
