//! depsync node - worker side of cluster dependency management
//!
//! Connects to the broker under its node key and serves the master's
//! requests for every ecosystem it has a package manager for:
//! - Update: list installed packages and report them back
//! - Install / Uninstall: run pip or npm, stream logs, report task status
//! - Heartbeats so the master keeps the node in its active set

mod config;

use anyhow::{Context, Result};
use config::NodeConfig;
use depsync_core::ecosystem::registry_client;
use depsync_core::transport::mqtt::MqttConnector;
use depsync_core::workspace::LocalWorkspace;
use depsync_core::{Link, Managers, NodeAgent, Router};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("depsync=info,depsync_core=info,depsync_node=info")),
        )
        .init();

    info!("Starting depsync node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load().await.context("Failed to load node config")?;
    info!(node = %config.node_key, master = %config.master_key, "config loaded");

    let connector = Arc::new(MqttConnector::new(config.mqtt.clone()));
    let link = Arc::new(Link::new(config.node_key.clone(), connector));
    let router = Arc::new(Router::new(config.max_in_flight));

    let managers = Managers::system(registry_client().context("Failed to build HTTP client")?);
    if let Err(e) = tokio::fs::create_dir_all(&config.workspace_root).await {
        warn!(path = %config.workspace_root.display(), error = %e, "workspace root unavailable");
    }
    let workspace = Arc::new(LocalWorkspace::new(config.workspace_root.clone()));
    let agent = NodeAgent::new(link.clone(), config.master_key.clone(), managers, workspace);
    agent.register(&router);
    info!(ecosystems = ?agent.ecosystems(), "handlers registered");

    agent.spawn_heartbeat(
        config.display_name(),
        false,
        Duration::from_secs(config.heartbeat_interval_secs.max(1)),
    );

    let run = tokio::spawn(link.clone().run(router));

    // announce, then push the local package lists without waiting for a round
    {
        let agent = agent.clone();
        let link = link.clone();
        let name = config.display_name();
        tokio::spawn(async move {
            link.wait_connected(None).await;
            if let Err(e) = agent.heartbeat(&name, false).await {
                warn!(error = %e, "initial heartbeat failed");
            }
            for eco in agent.ecosystems() {
                match agent.report_installed(eco, eco.default_command()).await {
                    Ok(count) => info!(eco = %eco, count, "installed packages reported"),
                    Err(e) => warn!(eco = %eco, error = %e, "initial report failed"),
                }
            }
        });
    }

    tokio::select! {
        res = run => match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "link stopped"),
            Err(e) => error!(error = %e, "link task panicked"),
        },
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
