/*!
In-process cluster

One master (store, coordinator, task tracker, node directory) and any number
of agents, all linked through a `MemoryHub`. Every agent gets its own
`FakeManager`, so tests can script and inspect each node independently.
*/

use crate::fakes::FakeManager;
use anyhow::{bail, Result};
use depsync_core::transport::memory::MemoryHub;
use depsync_core::workspace::LocalWorkspace;
use depsync_core::{
    Coordinator, CoordinatorConfig, Ecosystem, Link, Managers, NodeAgent, NodeDirectory, Router,
    Store, TaskTracker,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const MASTER_KEY: &str = "master";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Test logging; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub struct AgentHandle {
    pub agent: Arc<NodeAgent>,
    pub manager: Arc<FakeManager>,
    pub link: Arc<Link>,
}

pub struct ClusterHarness {
    pub hub: MemoryHub,
    pub store: Arc<Store>,
    pub master: Arc<Link>,
    pub coordinator: Arc<Coordinator>,
    pub registry: Arc<FakeManager>,
    pub tasks: TaskTracker,
    pub nodes: NodeDirectory,
    pub agents: BTreeMap<String, AgentHandle>,
    workspace_root: PathBuf,
    loops: Vec<JoinHandle<()>>,
}

impl ClusterHarness {
    /// Starts the master and one connected agent per key, each with an
    /// empty package set.
    pub async fn start(agent_keys: &[&str], config: CoordinatorConfig) -> Result<Self> {
        init_tracing();
        let hub = MemoryHub::new();
        let store = Arc::new(Store::in_memory());
        store.seed_default_settings()?;
        let nodes = NodeDirectory::new(store.clone());
        let tasks = TaskTracker::new(store.clone());

        let master = Arc::new(Link::new(MASTER_KEY, hub.connector()));
        let router = Arc::new(Router::default());
        let registry = Arc::new(FakeManager::new(Ecosystem::Python));
        let coordinator = Coordinator::new(master.clone(), store.clone(), registry.clone(), config);
        coordinator.register(&router);
        tasks.register(&router);
        nodes.register(&router);

        let mut harness = Self {
            hub,
            store,
            master: master.clone(),
            coordinator,
            registry,
            tasks,
            nodes,
            agents: BTreeMap::new(),
            workspace_root: std::env::temp_dir(),
            loops: Vec::new(),
        };
        harness.spawn_link(master, router);
        if !harness.master.wait_connected(Some(CONNECT_TIMEOUT)).await {
            bail!("master never connected");
        }
        for key in agent_keys {
            harness.add_agent(key, FakeManager::new(Ecosystem::Python)).await?;
        }
        Ok(harness)
    }

    /// Directory that agents resolve workspace references against.
    pub fn set_workspace_root(&mut self, root: impl Into<PathBuf>) {
        self.workspace_root = root.into();
    }

    /// Registers `key` with the master and connects an agent for it.
    pub async fn add_agent(&mut self, key: &str, manager: FakeManager) -> Result<Arc<FakeManager>> {
        self.nodes.seed(key, false)?;
        let manager = Arc::new(manager);
        let link = Arc::new(Link::new(key, self.hub.connector()));
        let router = Arc::new(Router::default());
        let agent = NodeAgent::new(
            link.clone(),
            MASTER_KEY,
            Managers::new().with(manager.clone()),
            Arc::new(LocalWorkspace::new(self.workspace_root.clone())),
        );
        agent.register(&router);
        self.spawn_link(link.clone(), router);
        if !link.wait_connected(Some(CONNECT_TIMEOUT)).await {
            bail!("agent {key} never connected");
        }
        self.agents.insert(
            key.to_string(),
            AgentHandle {
                agent,
                manager: manager.clone(),
                link,
            },
        );
        Ok(manager)
    }

    /// A registered, connected node that never answers anything.
    pub async fn add_silent_node(&mut self, key: &str) -> Result<()> {
        self.nodes.seed(key, false)?;
        let link = Arc::new(Link::new(key, self.hub.connector()));
        self.spawn_link(link.clone(), Arc::new(Router::default()));
        if !link.wait_connected(Some(CONNECT_TIMEOUT)).await {
            bail!("silent node {key} never connected");
        }
        Ok(())
    }

    /// A registered node with no stream at all; sends to it fail.
    pub fn add_unreachable_node(&self, key: &str) -> Result<()> {
        self.nodes.seed(key, false)?;
        Ok(())
    }

    pub fn manager(&self, key: &str) -> Option<Arc<FakeManager>> {
        self.agents.get(key).map(|a| a.manager.clone())
    }

    /// Stored dependency names for `key`, sorted.
    pub fn dependencies_of(&self, key: &str) -> Vec<String> {
        let Some(node) = self.nodes.by_key(key) else {
            return Vec::new();
        };
        let mut names: Vec<String> = self
            .store
            .dependencies
            .find(|d| d.node_id == node.id)
            .into_iter()
            .map(|d| d.name)
            .collect();
        names.sort();
        names
    }

    fn spawn_link(&mut self, link: Arc<Link>, router: Arc<Router>) {
        self.loops.push(tokio::spawn(async move {
            let _ = link.run(router).await;
        }));
    }
}

impl Drop for ClusterHarness {
    fn drop(&mut self) {
        for handle in &self.loops {
            handle.abort();
        }
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
