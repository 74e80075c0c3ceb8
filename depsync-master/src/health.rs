use depsync_core::{Link, NodeDirectory, TaskTracker};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
pub struct MasterHealth {
    pub uptime_seconds: u64,
    pub link_status: String,
    pub link_reconnects: u32,
    pub nodes_active: usize,
    pub nodes_total: usize,
    pub tasks_running: usize,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    link: Arc<Link>,
    nodes: NodeDirectory,
    tasks: TaskTracker,
}

impl HealthTracker {
    pub fn new(link: Arc<Link>, nodes: NodeDirectory, tasks: TaskTracker) -> Self {
        Self {
            start_time: Instant::now(),
            link,
            nodes,
            tasks,
        }
    }

    pub fn get_health(&self) -> MasterHealth {
        let status = if self.link.is_connected() {
            "connected"
        } else if self.link.reconnects() > 0 {
            "reconnecting"
        } else {
            "connecting"
        };
        let nodes = self.nodes.all();
        MasterHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            link_status: status.to_string(),
            link_reconnects: self.link.reconnects(),
            nodes_active: nodes.iter().filter(|n| n.active).count(),
            nodes_total: nodes.len(),
            tasks_running: self.tasks.running().len(),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }

    /// Logs a health line every `every`.
    pub fn spawn_health_logger(&self, every: Duration) {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let h = tracker.get_health();
                info!(
                    uptime = h.uptime_seconds,
                    link = %h.link_status,
                    nodes_active = h.nodes_active,
                    tasks_running = h.tasks_running,
                    "health"
                );
            }
        });
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
