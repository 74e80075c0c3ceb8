//! Reconnectable envelope stream between a node and the rest of the cluster.
//!
//! A [`Connector`] opens one stream and hands back its two halves. [`Link`]
//! owns the current sink, performs the `CONNECT` handshake, and in
//! [`Link::run`] keeps the receive loop alive across EOF and errors,
//! reconnecting with exponential [`Backoff`].

pub mod memory;
pub mod mqtt;

use crate::error::TransportError;
use crate::protocol::{Envelope, Message, StreamCode};
use crate::router::Router;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

#[async_trait]
pub trait EnvelopeSource: Send {
    /// `Ok(None)` is end-of-stream.
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError>;
}

pub type StreamHalves = (Arc<dyn EnvelopeSink>, Box<dyn EnvelopeSource>);

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, identity: &str) -> Result<StreamHalves, TransportError>;
}

#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 2,
            max: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

pub struct Link {
    identity: String,
    connector: Arc<dyn Connector>,
    sink: RwLock<Option<Arc<dyn EnvelopeSink>>>,
    backoff: Backoff,
    connected: watch::Sender<bool>,
    reconnects: AtomicU32,
}

impl Link {
    pub fn new(identity: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self::with_backoff(identity, connector, Backoff::default())
    }

    pub fn with_backoff(
        identity: impl Into<String>,
        connector: Arc<dyn Connector>,
        backoff: Backoff,
    ) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            identity: identity.into(),
            connector,
            sink: RwLock::new(None),
            backoff,
            connected,
            reconnects: AtomicU32::new(0),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Opens a stream, retrying with backoff, and sends the identity handshake.
    pub async fn connect(&self) -> Result<Box<dyn EnvelopeSource>, TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.try_connect().await {
                Ok(source) => {
                    info!(node = %self.identity, attempt, "stream connected");
                    return Ok(source);
                }
                Err(e) => {
                    attempt += 1;
                    if self.backoff.exhausted(attempt) {
                        warn!(node = %self.identity, error = %e, "giving up on connect");
                        return Err(TransportError::Exhausted(attempt));
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(node = %self.identity, error = %e, ?delay, "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<Box<dyn EnvelopeSource>, TransportError> {
        let (sink, source) = self.connector.connect(&self.identity).await?;
        sink.send(Envelope::connect(&self.identity)).await?;
        *self.sink.write() = Some(sink);
        self.connected.send_replace(true);
        Ok(source)
    }

    fn mark_disconnected(&self) {
        *self.sink.write() = None;
        self.connected.send_replace(false);
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let sink = self.sink.read().clone().ok_or(TransportError::NotConnected)?;
        sink.send(envelope).await
    }

    pub async fn send_message(&self, to: &str, message: &Message) -> Result<(), TransportError> {
        let envelope = Envelope::send(&self.identity, to, message)?;
        self.send(envelope).await
    }

    /// Resolves once a stream is up. Returns false on timeout.
    pub async fn wait_connected(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.connected.subscribe();
        let wait = rx.wait_for(|up| *up);
        match timeout {
            Some(limit) => matches!(tokio::time::timeout(limit, wait).await, Ok(Ok(_))),
            None => wait.await.is_ok(),
        }
    }

    /// Receive loop. Only returns when reconnection is exhausted.
    pub async fn run(self: Arc<Self>, router: Arc<Router>) -> Result<(), TransportError> {
        loop {
            let mut source = self.connect().await?;
            loop {
                match source.recv().await {
                    Ok(Some(envelope)) => match envelope.code {
                        StreamCode::Send => {
                            router.dispatch(envelope).await;
                        }
                        StreamCode::Connect => {
                            debug!(node = %self.identity, peer = %envelope.node_key, "peer handshake");
                        }
                    },
                    Ok(None) => {
                        warn!(node = %self.identity, "stream closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(node = %self.identity, error = %e, "stream broken");
                        break;
                    }
                }
            }
            self.mark_disconnected();
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.backoff.initial).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryHub;
    use super::*;
    use crate::models::Ecosystem;
    use crate::protocol::{EcosystemOp, OperationCode, UpdateRequest};
    use crate::router::handler_fn;
    use tokio::sync::mpsc;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), Duration::from_millis(500));
        assert_eq!(b.delay(1), Duration::from_secs(1));
        assert_eq!(b.delay(3), Duration::from_secs(4));
        assert_eq!(b.delay(10), Duration::from_secs(30));
        assert_eq!(b.delay(200), Duration::from_secs(30));
    }

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _identity: &str) -> Result<StreamHalves, TransportError> {
            Err(TransportError::Connect("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_max_attempts() {
        let backoff = Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(2),
            max_attempts: Some(3),
            ..Backoff::default()
        };
        let link = Link::with_backoff("w1", Arc::new(RefusingConnector), backoff);
        match link.connect().await {
            Err(TransportError::Exhausted(n)) => assert_eq!(n, 3),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let hub = MemoryHub::new();
        let link = Link::new("w1", hub.connector());
        let err = link.send(Envelope::connect("w1")).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_link_reconnects_after_stream_drop() {
        let hub = MemoryHub::new();
        let backoff = Backoff {
            initial: Duration::from_millis(5),
            ..Backoff::default()
        };
        let master = Arc::new(Link::with_backoff("master", hub.connector(), backoff.clone()));
        let worker = Arc::new(Link::with_backoff("w1", hub.connector(), backoff));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router::new(8));
        let code = OperationCode::Ecosystem(Ecosystem::Python, EcosystemOp::Update);
        router.register(
            code,
            handler_fn(move |_env, msg| {
                let tx = tx.clone();
                async move {
                    let req: UpdateRequest = msg.decode().unwrap();
                    tx.send(req.command).unwrap();
                }
            }),
        );

        tokio::spawn(master.clone().run(Arc::new(Router::new(8))));
        tokio::spawn(worker.clone().run(router));
        assert!(master.wait_connected(Some(Duration::from_secs(2))).await);
        assert!(worker.wait_connected(Some(Duration::from_secs(2))).await);
        assert_eq!(hub.handshakes().iter().filter(|k| *k == "w1").count(), 1);

        hub.disconnect("w1");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while hub.handshakes().iter().filter(|k| *k == "w1").count() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "worker never reconnected");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(worker.reconnects() >= 1);

        let msg = Message::new(code, &UpdateRequest { command: "pip".into() }).unwrap();
        master.send_message("w1", &msg).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("pip"));
    }
}
