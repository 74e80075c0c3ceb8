use depsync_core::transport::mqtt::MqttConf;
use depsync_core::CoordinatorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MasterConfig {
    pub node_key: String,
    pub mqtt: MqttConf,
    pub http_port: u16,
    pub data_dir: PathBuf,
    /// Per-node deadline of an Update round. `null` waits for every node forever.
    pub round_timeout_secs: Option<u64>,
    pub task_timeout_secs: Option<u64>,
    pub version_sweep_interval_secs: u64,
    pub node_timeout_secs: u64,
    pub purge_interval_secs: u64,
    pub max_in_flight: usize,
    /// Also manage the master's own packages.
    pub local_agent: bool,
    pub workspace_root: PathBuf,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            node_key: "master".into(),
            mqtt: MqttConf::default(),
            http_port: 8080,
            data_dir: PathBuf::from("./data"),
            round_timeout_secs: Some(60),
            task_timeout_secs: Some(3600),
            version_sweep_interval_secs: 3600,
            node_timeout_secs: 90,
            purge_interval_secs: 600,
            max_in_flight: 64,
            local_agent: true,
            workspace_root: PathBuf::from("./workspace"),
        }
    }
}

impl MasterConfig {
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            round_timeout: self.round_timeout_secs.map(Duration::from_secs),
            task_timeout: self.task_timeout_secs.map(Duration::from_secs),
        }
    }
}

fn parse(txt: &str) -> MasterConfig {
    if txt.trim().is_empty() {
        return MasterConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!(error = %e, "invalid master config, using defaults");
        MasterConfig::default()
    })
}

pub async fn load_config() -> MasterConfig {
    let path = std::env::var("DEPSYNC_MASTER_CONFIG").unwrap_or_else(|_| "master.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        info!(path = %path, "loaded master config");
        parse(&txt)
    } else {
        info!(path = %path, "no master config, using defaults");
        MasterConfig::default()
    }
}
