//! In-process hub connecting any number of links by identity.
//! Used by tests and single-process deployments.

use super::{Connector, EnvelopeSink, EnvelopeSource, StreamHalves};
use crate::error::TransportError;
use crate::protocol::{Envelope, StreamCode};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Peer {
    generation: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<String, Peer>,
    next_generation: u64,
    handshakes: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector { hub: self.clone() })
    }

    /// Drops the peer's stream; its source sees end-of-stream.
    pub fn disconnect(&self, identity: &str) -> bool {
        self.state.lock().peers.remove(identity).is_some()
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.state.lock().peers.contains_key(identity)
    }

    /// Identities in the order their `CONNECT` handshakes arrived.
    pub fn handshakes(&self) -> Vec<String> {
        self.state.lock().handshakes.clone()
    }
}

struct MemoryConnector {
    hub: MemoryHub,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, identity: &str) -> Result<StreamHalves, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut state = self.hub.state.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            // a newer stream replaces the old one, which then reads EOF
            state.peers.insert(identity.to_string(), Peer { generation, tx });
            generation
        };
        let sink = MemorySink {
            hub: self.hub.clone(),
            identity: identity.to_string(),
            generation,
        };
        Ok((Arc::new(sink), Box::new(MemorySource { rx })))
    }
}

struct MemorySink {
    hub: MemoryHub,
    identity: String,
    generation: u64,
}

#[async_trait]
impl EnvelopeSink for MemorySink {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        let current = state
            .peers
            .get(&self.identity)
            .is_some_and(|p| p.generation == self.generation);
        if !current {
            return Err(TransportError::Closed);
        }
        if envelope.code == StreamCode::Connect {
            state.handshakes.push(envelope.node_key);
            return Ok(());
        }
        let peer = state
            .peers
            .get(&envelope.to)
            .ok_or_else(|| TransportError::UnknownPeer(envelope.to.clone()))?;
        peer.tx.send(envelope).map_err(|_| TransportError::Closed)
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

#[async_trait]
impl EnvelopeSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(from: &str, to: &str) -> Envelope {
        Envelope {
            code: StreamCode::Send,
            node_key: from.into(),
            from: from.into(),
            to: to.into(),
            data: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_routes_by_destination_key() {
        let hub = MemoryHub::new();
        let conn = hub.connector();
        let (a_sink, _a_src) = conn.connect("a").await.unwrap();
        let (_b_sink, mut b_src) = conn.connect("b").await.unwrap();

        a_sink.send(envelope("a", "b")).await.unwrap();
        let got = b_src.recv().await.unwrap().unwrap();
        assert_eq!(got.from, "a");

        let err = a_sink.send(envelope("a", "nobody")).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(k) if k == "nobody"));
    }

    #[tokio::test]
    async fn test_reconnect_closes_previous_stream() {
        let hub = MemoryHub::new();
        let conn = hub.connector();
        let (old_sink, mut old_src) = conn.connect("a").await.unwrap();
        let (_new_sink, _new_src) = conn.connect("a").await.unwrap();

        assert!(old_src.recv().await.unwrap().is_none());
        assert!(matches!(
            old_sink.send(envelope("a", "a")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_yields_eof() {
        let hub = MemoryHub::new();
        let (_sink, mut src) = hub.connector().connect("a").await.unwrap();
        assert!(hub.is_connected("a"));
        assert!(hub.disconnect("a"));
        assert!(src.recv().await.unwrap().is_none());
        assert!(!hub.is_connected("a"));
    }
}
