//! Node configuration
//!
//! TOML file at `$DEPSYNC_NODE_CONFIG` or `<config dir>/depsync-node/config.toml`.
//! Every field has a default; the node key defaults to the hostname.

use anyhow::Result;
use depsync_core::transport::mqtt::MqttConf;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_key: String,
    /// Display name sent with heartbeats.
    pub name: Option<String>,
    pub master_key: String,
    pub mqtt: MqttConf,
    pub heartbeat_interval_secs: u64,
    pub max_in_flight: usize,
    pub workspace_root: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_key: default_node_key(),
            name: None,
            master_key: "master".to_string(),
            mqtt: MqttConf::default(),
            heartbeat_interval_secs: 30,
            max_in_flight: 64,
            workspace_root: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("depsync-node")
                .join("workspace"),
        }
    }
}

fn default_node_key() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]))
}

impl NodeConfig {
    /// Load config from `$DEPSYNC_NODE_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("DEPSYNC_NODE_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("depsync-node");
        path.push("config.toml");
        Ok(path)
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.node_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.master_key, "master");
        assert!(!config.node_key.is_empty());
        assert_eq!(config.display_name(), config.node_key);
    }

    #[test]
    fn test_partial_toml() {
        let config: NodeConfig = toml::from_str(
            "node_key = \"worker-3\"\nheartbeat_interval_secs = 5\n[mqtt]\nhost = \"broker\"\nport = 1884\n",
        )
        .unwrap();
        assert_eq!(config.node_key, "worker-3");
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.mqtt.host, "broker");
        assert_eq!(config.max_in_flight, 64);
    }
}
