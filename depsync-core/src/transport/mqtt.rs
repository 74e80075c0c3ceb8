//! Envelope stream over an MQTT broker.
//!
//! Every identity subscribes to `depsync/stream/{identity}`; an envelope is
//! published to the topic of its `to` key. Handshakes go to `depsync/connect`,
//! which only connectors built with [`MqttConnector::observe_handshakes`] listen to.

use super::{Connector, EnvelopeSink, EnvelopeSource, StreamHalves};
use crate::error::TransportError;
use crate::protocol::{Envelope, StreamCode};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const CONNECT_TOPIC: &str = "depsync/connect";
const MAX_PACKET: usize = 1024 * 1024;
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);

pub fn stream_topic(key: &str) -> String {
    format!("depsync/stream/{key}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
        }
    }
}

pub struct MqttConnector {
    conf: MqttConf,
    keep_alive: Duration,
    handshakes: bool,
}

impl MqttConnector {
    pub fn new(conf: MqttConf) -> Self {
        Self {
            conf,
            keep_alive: Duration::from_secs(15),
            handshakes: false,
        }
    }

    /// Also receive the `CONNECT` envelopes of every other node (master side).
    pub fn observe_handshakes(mut self) -> Self {
        self.handshakes = true;
        self
    }

    fn options(&self, identity: &str) -> MqttOptions {
        let client_id = format!("depsync-{identity}-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let mut opts = MqttOptions::new(client_id, &self.conf.host, self.conf.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        opts.set_max_packet_size(MAX_PACKET, MAX_PACKET);
        opts
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    let wait = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }
    };
    tokio::time::timeout(CONNACK_TIMEOUT, wait)
        .await
        .map_err(|_| TransportError::Connect("timed out waiting for CONNACK".into()))?
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, identity: &str) -> Result<StreamHalves, TransportError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(identity), 64);
        await_connack(&mut eventloop).await?;

        let own_topic = stream_topic(identity);
        client
            .subscribe(&own_topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if self.handshakes {
            client
                .subscribe(CONNECT_TOPIC, QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
        }

        let (tx, rx) = mpsc::channel(256);
        let poll = tokio::spawn(pump(eventloop, own_topic, tx));
        let sink = MqttSink { client };
        Ok((Arc::new(sink), Box::new(MqttSource { rx, poll })))
    }
}

async fn pump(
    mut eventloop: EventLoop,
    own_topic: String,
    tx: mpsc::Sender<Result<Envelope, TransportError>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                if p.topic != own_topic && p.topic != CONNECT_TOPIC {
                    continue;
                }
                match serde_json::from_slice::<Envelope>(&p.payload) {
                    Ok(env) => {
                        if tx.send(Ok(env)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(topic = %p.topic, error = %e, "dropping undecodable envelope"),
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                // dropping tx surfaces as end-of-stream
                debug!("broker sent disconnect");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Err(TransportError::Connect(e.to_string()))).await;
                return;
            }
        }
    }
}

struct MqttSink {
    client: AsyncClient,
}

#[async_trait]
impl EnvelopeSink for MqttSink {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let topic = match envelope.code {
            StreamCode::Connect => CONNECT_TOPIC.to_string(),
            StreamCode::Send => stream_topic(&envelope.to),
        };
        let payload = serde_json::to_vec(&envelope)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

struct MqttSource {
    rx: mpsc::Receiver<Result<Envelope, TransportError>>,
    poll: JoinHandle<()>,
}

#[async_trait]
impl EnvelopeSource for MqttSource {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(env)) => Ok(Some(env)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl Drop for MqttSource {
    fn drop(&mut self) {
        self.poll.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        assert_eq!(stream_topic("worker-7"), "depsync/stream/worker-7");
        assert_eq!(CONNECT_TOPIC, "depsync/connect");
    }

    #[test]
    fn test_client_ids_are_unique_per_connection() {
        let c = MqttConnector::new(MqttConf::default());
        let a = c.options("w1");
        let b = c.options("w1");
        assert_ne!(a.client_id(), b.client_id());
        assert!(a.client_id().starts_with("depsync-w1-"));
    }
}
