//! Worker side of the protocol.
//!
//! Handles `{eco}_update`, `{eco}_install` and `{eco}_uninstall` for every
//! ecosystem it has a [`PackageManager`] for. Install and uninstall always
//! report a terminal task status, then re-send the installed list so the
//! master's view heals itself.

use crate::ecosystem::{InstallPlan, InstallTarget, Managers, PackageManager};
use crate::error::{CoreError, TransportError, WorkspaceError};
use crate::log_relay::{LogRelay, LogSink, MasterLogSink};
use crate::models::{Ecosystem, TaskStatus};
use crate::protocol::{
    salvage_task_id, EcosystemOp, InstallRequest, Message, NodeHeartbeat, OperationCode,
    TaskStatusUpdate, UninstallRequest, UpdateRequest,
};
use crate::router::{handler_fn, Router};
use crate::transport::Link;
use crate::workspace::{config_file, read_manifest, Workspace};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct NodeAgent {
    master_key: String,
    link: Arc<Link>,
    managers: Managers,
    workspace: Arc<dyn Workspace>,
    logs: Arc<dyn LogSink>,
}

impl NodeAgent {
    pub fn new(
        link: Arc<Link>,
        master_key: impl Into<String>,
        managers: Managers,
        workspace: Arc<dyn Workspace>,
    ) -> Arc<Self> {
        let master_key = master_key.into();
        let logs: Arc<dyn LogSink> = Arc::new(MasterLogSink::new(link.clone(), master_key.clone()));
        Arc::new(Self {
            master_key,
            link,
            managers,
            workspace,
            logs,
        })
    }

    pub fn key(&self) -> &str {
        self.link.identity()
    }

    pub fn ecosystems(&self) -> Vec<Ecosystem> {
        self.managers.ecosystems()
    }

    fn manager(&self, eco: Ecosystem) -> Result<Arc<dyn PackageManager>, CoreError> {
        self.managers.get(eco).ok_or(CoreError::ManagerMissing(eco))
    }

    pub fn register(self: &Arc<Self>, router: &Router) {
        for eco in self.managers.ecosystems() {
            let this = self.clone();
            router.register(
                OperationCode::Ecosystem(eco, EcosystemOp::Update),
                handler_fn(move |_env, msg| {
                    let this = this.clone();
                    async move { this.on_update(eco, msg).await }
                }),
            );
            let this = self.clone();
            router.register(
                OperationCode::Ecosystem(eco, EcosystemOp::Install),
                handler_fn(move |_env, msg| {
                    let this = this.clone();
                    async move { this.on_install(eco, msg).await }
                }),
            );
            let this = self.clone();
            router.register(
                OperationCode::Ecosystem(eco, EcosystemOp::Uninstall),
                handler_fn(move |_env, msg| {
                    let this = this.clone();
                    async move { this.on_uninstall(eco, msg).await }
                }),
            );
        }
    }

    /// Lists local packages and sends them to the master as `{eco}_save`.
    pub async fn report_installed(&self, eco: Ecosystem, command: &str) -> Result<usize, CoreError> {
        let packages = self.manager(eco)?.list(command).await?;
        let count = packages.len();
        let msg = Message::new(OperationCode::Ecosystem(eco, EcosystemOp::Save), &packages)?;
        self.link.send_message(&self.master_key, &msg).await?;
        debug!(eco = %eco, count, "installed list reported");
        Ok(count)
    }

    async fn on_update(&self, eco: Ecosystem, msg: Message) {
        let command = match msg.decode::<UpdateRequest>() {
            Ok(req) => req.command,
            Err(e) => {
                warn!(eco = %eco, error = %e, "bad update payload");
                return;
            }
        };
        if let Err(e) = self.report_installed(eco, &command).await {
            error!(eco = %eco, error = %e, "update report failed");
        }
    }

    async fn on_install(&self, eco: Ecosystem, msg: Message) {
        match msg.decode::<InstallRequest>() {
            Ok(req) => {
                info!(eco = %eco, task_id = %req.task_id, names = ?req.names, "install requested");
                let result = self.install(eco, &req).await;
                self.report_status(req.task_id, result).await;
                self.follow_up(eco, &req.command).await;
            }
            Err(e) => self.reject(eco, &msg, e).await,
        }
    }

    async fn on_uninstall(&self, eco: Ecosystem, msg: Message) {
        match msg.decode::<UninstallRequest>() {
            Ok(req) => {
                info!(eco = %eco, task_id = %req.task_id, names = ?req.names, "uninstall requested");
                let result = self.uninstall(eco, &req).await;
                self.report_status(req.task_id, result).await;
                self.follow_up(eco, &req.command).await;
            }
            Err(e) => self.reject(eco, &msg, e).await,
        }
    }

    /// Fails the task of an undecodable request when its id can be recovered.
    async fn reject(&self, eco: Ecosystem, msg: &Message, e: serde_json::Error) {
        warn!(eco = %eco, code = %msg.code, error = %e, "bad task payload");
        if let Some(task_id) = salvage_task_id(&msg.data) {
            self.report_status(task_id, Err(CoreError::Payload(e))).await;
        }
        self.follow_up(eco, eco.default_command()).await;
    }

    async fn install(&self, eco: Ecosystem, req: &InstallRequest) -> Result<(), CoreError> {
        let manager = self.manager(eco)?;
        let target = if req.use_config_file {
            let reference = req
                .workspace_ref
                .as_deref()
                .ok_or_else(|| WorkspaceError::InvalidReference(String::new()))?;
            let dir = self.workspace.sync(reference).await?;
            // refuse a broken manifest before handing it to the package manager
            let reqs = read_manifest(&dir, eco).await?;
            debug!(task_id = %req.task_id, count = reqs.len(), "manifest validated");
            InstallTarget::ConfigFile(config_file(&dir, eco)?)
        } else {
            InstallTarget::Names(req.names.clone())
        };
        let plan = InstallPlan {
            command: req.command.clone(),
            proxy: req.proxy.clone(),
            upgrade: req.upgrade,
            target,
        };
        let relay = LogRelay::new(req.task_id, self.logs.clone());
        manager.install(&plan, &relay).await?;
        Ok(())
    }

    async fn uninstall(&self, eco: Ecosystem, req: &UninstallRequest) -> Result<(), CoreError> {
        let manager = self.manager(eco)?;
        let relay = LogRelay::new(req.task_id, self.logs.clone());
        manager.uninstall(&req.command, &req.names, &relay).await?;
        Ok(())
    }

    async fn report_status(&self, task_id: Uuid, result: Result<(), CoreError>) {
        let update = match result {
            Ok(()) => TaskStatusUpdate {
                task_id,
                status: TaskStatus::Finished,
                error: None,
            },
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "task failed");
                TaskStatusUpdate {
                    task_id,
                    status: TaskStatus::Error,
                    error: Some(e.to_string()),
                }
            }
        };
        let sent = match Message::new(OperationCode::UpdateTaskStatus, &update) {
            Ok(msg) => self.link.send_message(&self.master_key, &msg).await,
            Err(e) => Err(TransportError::Codec(e)),
        };
        if let Err(e) = sent {
            error!(task_id = %task_id, error = %e, "could not report task status");
        }
    }

    async fn follow_up(&self, eco: Ecosystem, command: &str) {
        if let Err(e) = self.report_installed(eco, command).await {
            warn!(eco = %eco, error = %e, "follow-up update failed");
        }
    }

    pub async fn heartbeat(&self, name: &str, is_master: bool) -> Result<(), TransportError> {
        let beat = NodeHeartbeat {
            name: name.to_string(),
            is_master,
        };
        let msg = Message::new(OperationCode::NodeHeartbeat, &beat)?;
        self.link.send_message(&self.master_key, &msg).await
    }

    /// Heartbeats every `interval` while the link is up.
    pub fn spawn_heartbeat(self: &Arc<Self>, name: String, is_master: bool, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if !this.link.is_connected() {
                    continue;
                }
                if let Err(e) = this.heartbeat(&name, is_master).await {
                    debug!(error = %e, "heartbeat not sent");
                }
            }
        })
    }
}
