//! Fan-out/fan-in signalling keyed by node.
//!
//! The broadcaster arms and waits on a node's [`Rendezvous`]; the Save
//! handler signals it. Entries live as long as the registry, so the key set
//! is bounded by the number of nodes ever seen.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::error::Elapsed;
use tracing::debug;

#[derive(Clone)]
pub struct Rendezvous {
    key: Arc<str>,
    tx: mpsc::Sender<bool>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<bool>>>,
}

impl Rendezvous {
    fn new(key: &str) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            key: Arc::from(key),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Never blocks. A second signal while one is pending is dropped.
    pub fn signal(&self) {
        match self.tx.try_send(true) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(node = %self.key, "rendezvous already signalled, dropping");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Discards a stale pending signal left over from outside a round.
    pub async fn arm(&self) {
        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_ok() {
            debug!(node = %self.key, "discarded stale signal");
        }
    }

    /// `None` waits forever.
    pub async fn wait(&self, deadline: Option<Duration>) -> Result<(), Elapsed> {
        let mut rx = self.rx.lock().await;
        match deadline {
            Some(limit) => tokio::time::timeout(limit, rx.recv()).await.map(|_| ()),
            None => {
                rx.recv().await;
                Ok(())
            }
        }
    }
}

#[derive(Default)]
pub struct RendezvousRegistry {
    entries: Mutex<HashMap<String, Rendezvous>>,
}

impl RendezvousRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-create.
    pub fn get(&self, key: &str) -> Rendezvous {
        self.entries
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Rendezvous::new(key))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_releases_waiter() {
        let reg = RendezvousRegistry::new();
        let r = reg.get("w1");
        let waiter = {
            let r = r.clone();
            tokio::spawn(async move { r.wait(Some(Duration::from_secs(2))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        reg.get("w1").signal();
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_signal() {
        let reg = RendezvousRegistry::new();
        let res = reg.get("silent").wait(Some(Duration::from_millis(20))).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_wait_forever_stays_pending() {
        let r = RendezvousRegistry::new().get("silent");
        let outer = tokio::time::timeout(Duration::from_millis(50), r.wait(None)).await;
        assert!(outer.is_err());
    }

    #[tokio::test]
    async fn test_double_signal_does_not_block_and_arm_clears() {
        let r = RendezvousRegistry::new().get("w1");
        r.signal();
        r.signal();
        r.arm().await;
        assert!(r.wait(Some(Duration::from_millis(20))).await.is_err());
    }
}
