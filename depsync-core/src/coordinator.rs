//! Master side of the protocol for one ecosystem.
//!
//! Update round: arm every active node's rendezvous, send `{eco}_update`,
//! wait for each node's `{eco}_save` to signal back. Save rewrites that
//! node's rows in one transaction and always signals, even on failure.
//! Install and Uninstall create one Running task per target and dispatch
//! best-effort; nodes report the outcome asynchronously.

use crate::ecosystem::PackageManager;
use crate::error::CoreError;
use crate::models::{Dependency, Ecosystem, InstalledPackage, Node, Setting, Task, TaskAction, TaskStatus};
use crate::nodes::NodeDirectory;
use crate::protocol::{
    EcosystemOp, Envelope, InstallRequest, Message, OperationCode, UninstallRequest, UpdateRequest,
};
use crate::rendezvous::RendezvousRegistry;
use crate::router::{handler_fn, Router};
use crate::store::Store;
use crate::tasks::TaskTracker;
use crate::transport::Link;
use crate::version_cache::VersionCache;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Per-node deadline of an Update round. `None` waits forever.
    pub round_timeout: Option<Duration>,
    /// Tasks still running after this long are failed with "timeout".
    pub task_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    pub node: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundReport {
    pub completed: Vec<String>,
    pub timed_out: Vec<String>,
    pub failed: Vec<NodeFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub tasks: Vec<Task>,
    pub failures: Vec<NodeFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaveSummary {
    pub inserted: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub resolved: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    #[default]
    All,
    Selected,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallCommand {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub mode: TargetMode,
    #[serde(default)]
    pub node_ids: Vec<Uuid>,
    #[serde(default)]
    pub upgrade: bool,
    #[serde(default)]
    pub use_config_file: bool,
    #[serde(default)]
    pub workspace_ref: Option<String>,
}

enum RoundOutcome {
    Completed,
    TimedOut,
    Failed(String),
}

pub struct Coordinator {
    ecosystem: Ecosystem,
    link: Arc<Link>,
    store: Arc<Store>,
    nodes: NodeDirectory,
    tasks: TaskTracker,
    rendezvous: RendezvousRegistry,
    versions: VersionCache,
    lookup: Arc<dyn PackageManager>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        link: Arc<Link>,
        store: Arc<Store>,
        lookup: Arc<dyn PackageManager>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ecosystem: lookup.ecosystem(),
            nodes: NodeDirectory::new(store.clone()),
            tasks: TaskTracker::new(store.clone()),
            link,
            store,
            rendezvous: RendezvousRegistry::new(),
            versions: VersionCache::new(),
            lookup,
            config,
        })
    }

    pub fn ecosystem(&self) -> Ecosystem {
        self.ecosystem
    }

    pub fn versions(&self) -> &VersionCache {
        &self.versions
    }

    pub fn lookup(&self) -> &Arc<dyn PackageManager> {
        &self.lookup
    }

    fn code(&self, op: EcosystemOp) -> OperationCode {
        OperationCode::Ecosystem(self.ecosystem, op)
    }

    fn setting(&self) -> Result<Setting, CoreError> {
        let setting = self
            .store
            .setting_for(self.ecosystem)
            .ok_or(CoreError::SettingMissing(self.ecosystem))?;
        if !setting.enabled {
            return Err(CoreError::EcosystemDisabled(self.ecosystem));
        }
        Ok(setting)
    }

    /// Registers the `{eco}_save` handler.
    pub fn register(self: &Arc<Self>, router: &Router) {
        let this = self.clone();
        router.register(
            self.code(EcosystemOp::Save),
            handler_fn(move |env, msg| {
                let this = this.clone();
                async move { this.on_save(env, msg) }
            }),
        );
    }

    fn on_save(&self, envelope: Envelope, message: Message) {
        match message.decode::<Vec<InstalledPackage>>() {
            Ok(packages) => match self.save(&envelope.node_key, &packages) {
                Ok(summary) => info!(
                    eco = %self.ecosystem,
                    node = %envelope.node_key,
                    inserted = summary.inserted,
                    deleted = summary.deleted,
                    "dependency list saved"
                ),
                Err(e) => warn!(eco = %self.ecosystem, node = %envelope.node_key, error = %e, "save failed"),
            },
            Err(e) => warn!(eco = %self.ecosystem, node = %envelope.node_key, error = %e, "bad save payload"),
        }
        // the broadcaster must never be left waiting on a failed save
        self.rendezvous.get(&envelope.node_key).signal();
    }

    /// Makes the stored rows of `node_key` match `packages` by name. Rows
    /// already present are left as they are.
    pub fn save(&self, node_key: &str, packages: &[InstalledPackage]) -> Result<SaveSummary, CoreError> {
        let node = self
            .nodes
            .by_key(node_key)
            .ok_or_else(|| CoreError::UnknownNode(node_key.to_string()))?;
        let eco = self.ecosystem;
        let reported: HashSet<&str> = packages.iter().map(|p| p.name.as_str()).collect();

        let summary = self.store.dependencies.transaction(|deps| {
            let owned = |d: &Dependency| d.ecosystem == eco && d.node_id == node.id;
            let before = deps.len();
            deps.retain(|d| !owned(d) || reported.contains(d.name.as_str()));
            let deleted = before - deps.len();

            let mut present: HashSet<String> =
                deps.iter().filter(|d| owned(d)).map(|d| d.name.clone()).collect();
            let mut inserted = 0;
            for pkg in packages {
                if present.insert(pkg.name.clone()) {
                    deps.push(Dependency {
                        id: Uuid::new_v4(),
                        ecosystem: eco,
                        name: pkg.name.clone(),
                        version: pkg.version.clone(),
                        latest_version: None,
                        node_id: node.id,
                    });
                    inserted += 1;
                }
            }
            Ok::<_, CoreError>(SaveSummary { inserted, deleted })
        })?;
        Ok(summary)
    }

    /// Runs one Update round over the active nodes, then starts a
    /// latest-version sweep in the background.
    pub async fn update(self: &Arc<Self>) -> Result<RoundReport, CoreError> {
        let setting = self.setting()?;
        let nodes = self.nodes.active();
        let msg = Message::new(
            self.code(EcosystemOp::Update),
            &UpdateRequest {
                command: setting.resolved_command(),
            },
        )?;
        info!(eco = %self.ecosystem, nodes = nodes.len(), "update round started");

        let outcomes = join_all(nodes.iter().map(|n| self.round_for(&n.key, &msg))).await;

        let mut report = RoundReport::default();
        for (node, outcome) in nodes.into_iter().zip(outcomes) {
            match outcome {
                RoundOutcome::Completed => report.completed.push(node.key),
                RoundOutcome::TimedOut => report.timed_out.push(node.key),
                RoundOutcome::Failed(error) => report.failed.push(NodeFailure { node: node.key, error }),
            }
        }
        info!(
            eco = %self.ecosystem,
            completed = report.completed.len(),
            timed_out = report.timed_out.len(),
            failed = report.failed.len(),
            "update round finished"
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.refresh_latest_versions().await;
        });
        Ok(report)
    }

    async fn round_for(&self, key: &str, msg: &Message) -> RoundOutcome {
        let rv = self.rendezvous.get(key);
        rv.arm().await;
        if let Err(e) = self.link.send_message(key, msg).await {
            warn!(eco = %self.ecosystem, node = %key, error = %e, "update dispatch failed");
            return RoundOutcome::Failed(e.to_string());
        }
        match rv.wait(self.config.round_timeout).await {
            Ok(()) => RoundOutcome::Completed,
            Err(_) => {
                warn!(eco = %self.ecosystem, node = %key, "node missed the update deadline");
                RoundOutcome::TimedOut
            }
        }
    }

    pub async fn install(self: &Arc<Self>, cmd: InstallCommand) -> Result<DispatchReport, CoreError> {
        let setting = self.setting()?;
        let targets = match cmd.mode {
            TargetMode::All => self.nodes.active(),
            TargetMode::Selected => self.nodes.by_ids(&cmd.node_ids),
        };
        let command = setting.resolved_command();
        let proxy = setting.resolved_proxy();

        let mut report = DispatchReport::default();
        for node in targets {
            let task = self.tasks.create(
                setting.id,
                self.ecosystem,
                node.id,
                cmd.names.clone(),
                TaskAction::Install,
            )?;
            let req = InstallRequest {
                task_id: task.id,
                upgrade: cmd.upgrade,
                names: cmd.names.clone(),
                proxy: proxy.clone(),
                command: command.clone(),
                use_config_file: cmd.use_config_file,
                workspace_ref: cmd.workspace_ref.clone(),
            };
            let msg = Message::new(self.code(EcosystemOp::Install), &req)?;
            self.dispatch(&node, task, &msg, &mut report).await;
        }
        self.spawn_watchdog(&report);
        Ok(report)
    }

    /// Uninstalls `names` from every active node that has any of them.
    pub async fn uninstall(self: &Arc<Self>, names: &[String]) -> Result<DispatchReport, CoreError> {
        let setting = self.setting()?;
        let eco = self.ecosystem;
        let rows = self
            .store
            .dependencies
            .find(|d| d.ecosystem == eco && names.contains(&d.name));

        let mut by_node: BTreeMap<String, (Node, Vec<String>)> = BTreeMap::new();
        for row in rows {
            let Some(node) = self.nodes.by_id(row.node_id) else {
                debug!(node_id = %row.node_id, "dependency owned by unknown node");
                continue;
            };
            if !node.active {
                continue;
            }
            let entry = by_node.entry(node.key.clone()).or_insert_with(|| (node, Vec::new()));
            if !entry.1.contains(&row.name) {
                entry.1.push(row.name);
            }
        }

        let command = setting.resolved_command();
        let mut report = DispatchReport::default();
        for (_, (node, node_names)) in by_node {
            let task = self.tasks.create(
                setting.id,
                eco,
                node.id,
                node_names.clone(),
                TaskAction::Uninstall,
            )?;
            let req = UninstallRequest {
                task_id: task.id,
                command: command.clone(),
                names: node_names,
            };
            let msg = Message::new(self.code(EcosystemOp::Uninstall), &req)?;
            self.dispatch(&node, task, &msg, &mut report).await;
        }
        self.spawn_watchdog(&report);
        Ok(report)
    }

    /// Sends one task message. A send failure fails that task only.
    async fn dispatch(&self, node: &Node, task: Task, msg: &Message, report: &mut DispatchReport) {
        match self.link.send_message(&node.key, msg).await {
            Ok(()) => {
                debug!(eco = %self.ecosystem, node = %node.key, task_id = %task.id, "task dispatched");
                report.tasks.push(task);
            }
            Err(e) => {
                warn!(eco = %self.ecosystem, node = %node.key, task_id = %task.id, error = %e, "dispatch failed");
                let error = e.to_string();
                let task = match self.tasks.transition(task.id, TaskStatus::Error, Some(error.clone())) {
                    Ok(t) => t,
                    Err(te) => {
                        warn!(task_id = %task.id, error = %te, "could not fail task");
                        task
                    }
                };
                report.tasks.push(task);
                report.failures.push(NodeFailure {
                    node: node.key.clone(),
                    error,
                });
            }
        }
    }

    fn spawn_watchdog(&self, report: &DispatchReport) {
        let Some(limit) = self.config.task_timeout else {
            return;
        };
        let ids: Vec<Uuid> = report
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.id)
            .collect();
        if ids.is_empty() {
            return;
        }
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            tasks.expire_running(&ids);
        });
    }

    /// Resolves `latest_version` for every row lacking one, one at a time.
    pub async fn refresh_latest_versions(&self) -> SweepReport {
        let eco = self.ecosystem;
        let pending = self
            .store
            .dependencies
            .find(|d| d.ecosystem == eco && d.latest_version.is_none());
        let mut report = SweepReport::default();
        for dep in pending {
            let lookup = self.lookup.clone();
            let name = dep.name.clone();
            let resolved = self
                .versions
                .resolve(&dep.name, || async move { lookup.latest_version(&name).await })
                .await;
            match resolved {
                Ok(version) => {
                    let updated = self
                        .store
                        .dependencies
                        .update(dep.id, |d| d.latest_version = Some(version));
                    match updated {
                        Ok(_) => report.resolved += 1,
                        Err(e) => {
                            warn!(eco = %eco, name = %dep.name, error = %e, "failed to store latest version");
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    debug!(eco = %eco, name = %dep.name, error = %e, "latest version lookup failed");
                    report.failed += 1;
                }
            }
        }
        if report.resolved + report.failed > 0 {
            info!(eco = %eco, resolved = report.resolved, failed = report.failed, "latest-version sweep done");
        }
        report
    }
}
