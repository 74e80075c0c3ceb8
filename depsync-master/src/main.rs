/**
 * DEPSYNC MASTER - entry point of the master process
 *
 * ROLE: wires config, store, MQTT link, router, one coordinator per
 * ecosystem, optional local agent, background loops and the HTTP API.
 *
 * BACKGROUND LOOPS: initial update round once the link is up, periodic
 * latest-version sweep, node liveness monitor, 24h TTL purge, health log.
 */

mod config;
mod health;
mod http;

use crate::config::{load_config, MasterConfig};
use crate::health::HealthTracker;
use crate::http::AppState;

use anyhow::{Context, Result};
use depsync_core::ecosystem::registry_client;
use depsync_core::store::RETENTION;
use depsync_core::transport::mqtt::MqttConnector;
use depsync_core::workspace::{LocalWorkspace, Workspace};
use depsync_core::{
    Coordinator, Ecosystem, Link, Managers, NodeAgent, NodeDirectory, Router, Store, TaskTracker,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

type Coordinators = Arc<BTreeMap<Ecosystem, Arc<Coordinator>>>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;

    // storage + seed data
    let store = Arc::new(Store::open(&cfg.data_dir).context("failed to open data dir")?);
    store.seed_default_settings().context("failed to seed settings")?;
    let nodes = NodeDirectory::new(store.clone());
    if cfg.local_agent {
        // only a master that runs its own agent is an Update target
        nodes
            .seed(&cfg.node_key, true)
            .context("failed to register master node")?;
    }
    let tasks = TaskTracker::new(store.clone());

    // transport
    let connector = Arc::new(MqttConnector::new(cfg.mqtt.clone()).observe_handshakes());
    let link = Arc::new(Link::new(cfg.node_key.clone(), connector));
    let router = Arc::new(Router::new(cfg.max_in_flight));

    // coordinators, one per ecosystem
    let managers = Managers::system(registry_client().context("failed to build HTTP client")?);
    let mut by_eco = BTreeMap::new();
    for eco in managers.ecosystems() {
        let Some(lookup) = managers.get(eco) else { continue };
        let coordinator = Coordinator::new(link.clone(), store.clone(), lookup, cfg.coordinator());
        coordinator.register(&router);
        by_eco.insert(eco, coordinator);
    }
    let coordinators: Coordinators = Arc::new(by_eco);
    tasks.register(&router);
    nodes.register(&router);

    let workspace: Arc<dyn Workspace> = Arc::new(LocalWorkspace::new(cfg.workspace_root.clone()));
    if cfg.local_agent {
        let agent = NodeAgent::new(link.clone(), cfg.node_key.clone(), managers, workspace.clone());
        agent.register(&router);
        info!(node = %cfg.node_key, "local agent enabled");
    }

    {
        let link = link.clone();
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = link.run(router).await {
                error!(error = %e, "link stopped");
            }
        });
    }

    spawn_initial_update(link.clone(), coordinators.clone());
    spawn_version_sweep(&cfg, coordinators.clone());
    spawn_liveness_monitor(&cfg, nodes.clone());
    spawn_purge(&cfg, store.clone());

    let health = HealthTracker::new(link.clone(), nodes.clone(), tasks.clone());
    health.spawn_health_logger(Duration::from_secs(300));

    let app_state = AppState {
        store,
        coordinators,
        tasks,
        nodes,
        health,
        workspace,
    };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    info!(%addr, "listening");
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}

fn spawn_initial_update(link: Arc<Link>, coordinators: Coordinators) {
    tokio::spawn(async move {
        link.wait_connected(None).await;
        for coordinator in coordinators.values().cloned() {
            tokio::spawn(async move {
                match coordinator.update().await {
                    Ok(report) => info!(
                        eco = %coordinator.ecosystem(),
                        completed = report.completed.len(),
                        "initial update done"
                    ),
                    Err(e) => warn!(eco = %coordinator.ecosystem(), error = %e, "initial update skipped"),
                }
            });
        }
    });
}

fn spawn_version_sweep(cfg: &MasterConfig, coordinators: Coordinators) {
    let every = Duration::from_secs(cfg.version_sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            for coordinator in coordinators.values() {
                coordinator.refresh_latest_versions().await;
            }
        }
    });
}

fn spawn_liveness_monitor(cfg: &MasterConfig, nodes: NodeDirectory) {
    let timeout = Duration::from_secs(cfg.node_timeout_secs.max(1));
    let master_key = cfg.local_agent.then(|| cfg.node_key.clone());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(timeout / 3);
        loop {
            interval.tick().await;
            // the local agent never heartbeats to itself
            if let Some(key) = &master_key {
                if let Err(e) = nodes.seed(key, true) {
                    warn!(error = %e, "failed to refresh master node");
                }
            }
            match nodes.mark_stale(timeout) {
                Ok(stale) if !stale.is_empty() => warn!(nodes = ?stale, "nodes went inactive"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "liveness check failed"),
            }
        }
    });
}

fn spawn_purge(cfg: &MasterConfig, store: Arc<Store>) {
    let every = Duration::from_secs(cfg.purge_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = store.purge_expired(OffsetDateTime::now_utc(), RETENTION) {
                warn!(error = %e, "purge failed");
            }
        }
    });
}
