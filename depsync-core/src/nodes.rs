//! Cluster membership as seen by the master.
//!
//! Nodes announce themselves with `node_heartbeat`; a monitor flips them
//! inactive once they go quiet. Only active nodes are targeted by dispatch.

use crate::error::StoreError;
use crate::models::Node;
use crate::protocol::{NodeHeartbeat, OperationCode};
use crate::router::{handler_fn, Router};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct NodeDirectory {
    store: Arc<Store>,
}

impl NodeDirectory {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn active(&self) -> Vec<Node> {
        self.store.nodes.find(|n| n.active)
    }

    pub fn all(&self) -> Vec<Node> {
        self.store.nodes.all()
    }

    pub fn by_key(&self, key: &str) -> Option<Node> {
        self.store.nodes.find_one(|n| n.key == key)
    }

    pub fn by_id(&self, id: Uuid) -> Option<Node> {
        self.store.nodes.get(id)
    }

    pub fn by_ids(&self, ids: &[Uuid]) -> Vec<Node> {
        self.store.nodes.find(|n| ids.contains(&n.id))
    }

    /// Inserts or refreshes a node from a heartbeat. Returns the stored node.
    pub fn heartbeat(&self, key: &str, beat: &NodeHeartbeat) -> Result<Node, StoreError> {
        let now = OffsetDateTime::now_utc();
        self.store.nodes.transaction(|nodes| {
            if let Some(node) = nodes.iter_mut().find(|n| n.key == key) {
                if !node.active {
                    info!(node = %key, "node back online");
                }
                node.name = beat.name.clone();
                node.is_master = beat.is_master;
                node.active = true;
                node.last_seen = now;
                return Ok(node.clone());
            }
            let mut node = Node::new(key, beat.is_master);
            node.name = beat.name.clone();
            node.last_seen = now;
            info!(node = %key, "node registered");
            nodes.push(node.clone());
            Ok(node)
        })
    }

    /// Registers a node without waiting for its first heartbeat.
    pub fn seed(&self, key: &str, is_master: bool) -> Result<Node, StoreError> {
        self.heartbeat(
            key,
            &NodeHeartbeat {
                name: key.to_string(),
                is_master,
            },
        )
    }

    /// Marks nodes not seen within `timeout` inactive. Returns their keys.
    pub fn mark_stale(&self, timeout: Duration) -> Result<Vec<String>, StoreError> {
        let cutoff = OffsetDateTime::now_utc() - timeout;
        self.store.nodes.transaction(|nodes| {
            let mut stale = Vec::new();
            for node in nodes.iter_mut().filter(|n| n.active && n.last_seen < cutoff) {
                node.active = false;
                stale.push(node.key.clone());
            }
            Ok(stale)
        })
    }

    pub fn register(&self, router: &Router) {
        let directory = self.clone();
        router.register(
            OperationCode::NodeHeartbeat,
            handler_fn(move |env, msg| {
                let directory = directory.clone();
                async move {
                    let beat = match msg.decode::<NodeHeartbeat>() {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(from = %env.from, error = %e, "bad heartbeat payload");
                            return;
                        }
                    };
                    if let Err(e) = directory.heartbeat(&env.node_key, &beat) {
                        warn!(node = %env.node_key, error = %e, "failed to record heartbeat");
                    }
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_upserts_by_key() {
        let dir = NodeDirectory::new(Arc::new(Store::in_memory()));
        let first = dir
            .heartbeat("w1", &NodeHeartbeat { name: "worker one".into(), is_master: false })
            .unwrap();
        let again = dir
            .heartbeat("w1", &NodeHeartbeat { name: "worker 1".into(), is_master: false })
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(dir.all().len(), 1);
        assert_eq!(dir.by_key("w1").unwrap().name, "worker 1");
    }

    #[test]
    fn test_mark_stale_then_revive() {
        let dir = NodeDirectory::new(Arc::new(Store::in_memory()));
        let node = dir.seed("w1", false).unwrap();
        dir.seed("w2", false).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        dir.seed("w2", false).unwrap();
        let stale = dir.mark_stale(Duration::from_millis(10)).unwrap();
        assert_eq!(stale, vec!["w1".to_string()]);
        assert_eq!(dir.active().len(), 1);

        dir.seed("w1", false).unwrap();
        assert_eq!(dir.active().len(), 2);
        assert_eq!(dir.by_ids(&[node.id]).len(), 1);
    }
}
