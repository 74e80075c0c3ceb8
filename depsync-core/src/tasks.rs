//! Task lifecycle and task logs.
//!
//! A task is created `Running` before dispatch and moves exactly once to
//! `Finished` or `Error`. Status and log batches arrive from nodes through
//! the `update_task` and `insert_logs` operations.

use crate::error::TaskError;
use crate::models::{Ecosystem, LogEntry, Task, TaskAction, TaskStatus};
use crate::protocol::{LogBatch, OperationCode, TaskStatusUpdate};
use crate::router::{handler_fn, Router};
use crate::store::Store;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const TIMEOUT_ERROR: &str = "timeout";

#[derive(Clone)]
pub struct TaskTracker {
    store: Arc<Store>,
}

impl TaskTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create(
        &self,
        setting_id: Uuid,
        ecosystem: Ecosystem,
        node_id: Uuid,
        names: Vec<String>,
        action: TaskAction,
    ) -> Result<Task, TaskError> {
        let task = Task {
            id: Uuid::new_v4(),
            setting_id,
            ecosystem,
            node_id,
            names,
            action,
            status: TaskStatus::Running,
            error: None,
            update_ts: OffsetDateTime::now_utc(),
        };
        self.store.tasks.insert(task.clone())?;
        debug!(task_id = %task.id, node_id = %node_id, ?action, "task created");
        Ok(task)
    }

    pub fn get(&self, id: Uuid) -> Option<Task> {
        self.store.tasks.get(id)
    }

    /// Moves a running task to a terminal status. Anything else is rejected.
    pub fn transition(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Task, TaskError> {
        self.store.tasks.transaction(|tasks| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(TaskError::NotFound(id))?;
            if task.status != TaskStatus::Running || !status.is_terminal() {
                return Err(TaskError::InvalidTransition {
                    from: task.status,
                    to: status,
                });
            }
            task.status = status;
            task.error = error;
            task.update_ts = OffsetDateTime::now_utc();
            Ok(task.clone())
        })
    }

    pub fn append_logs(&self, task_id: Uuid, lines: &[String]) -> Result<LogEntry, TaskError> {
        let entry = LogEntry {
            id: Uuid::new_v4(),
            task_id,
            content: lines.join("\n"),
            update_ts: OffsetDateTime::now_utc(),
        };
        self.store.logs.insert(entry.clone())?;
        Ok(entry)
    }

    /// Log entries of a task in arrival order.
    pub fn logs(&self, task_id: Uuid) -> Vec<LogEntry> {
        self.store.logs.find(|l| l.task_id == task_id)
    }

    /// Newest first. `all` disables pagination. Returns the page and the total.
    pub fn list(&self, page: usize, size: usize, all: bool) -> (Vec<Task>, usize) {
        let mut tasks = self.store.tasks.all();
        let total = tasks.len();
        tasks.sort_by(|a, b| b.update_ts.cmp(&a.update_ts));
        if !all {
            let size = size.max(1);
            let skip = page.saturating_sub(1).saturating_mul(size);
            tasks = tasks.into_iter().skip(skip).take(size).collect();
        }
        (tasks, total)
    }

    pub fn running(&self) -> Vec<Task> {
        self.store.tasks.find(|t| t.status == TaskStatus::Running)
    }

    /// Marks the given tasks `Error("timeout")` if they are still running.
    pub fn expire_running(&self, ids: &[Uuid]) -> usize {
        let mut expired = 0;
        for id in ids {
            match self.transition(*id, TaskStatus::Error, Some(TIMEOUT_ERROR.to_string())) {
                Ok(_) => {
                    warn!(task_id = %id, "task timed out");
                    expired += 1;
                }
                Err(TaskError::InvalidTransition { .. }) | Err(TaskError::NotFound(_)) => {}
                Err(e) => warn!(task_id = %id, error = %e, "failed to expire task"),
            }
        }
        expired
    }

    fn on_status(&self, update: TaskStatusUpdate) {
        match self.transition(update.task_id, update.status, update.error) {
            Ok(task) => info!(task_id = %task.id, status = ?task.status, "task status updated"),
            Err(e) => warn!(task_id = %update.task_id, error = %e, "task status rejected"),
        }
    }

    fn on_logs(&self, batch: LogBatch) {
        if let Err(e) = self.append_logs(batch.task_id, &batch.lines) {
            warn!(task_id = %batch.task_id, error = %e, "failed to store logs");
        }
    }

    /// Registers the `update_task` and `insert_logs` handlers.
    pub fn register(&self, router: &Router) {
        let tracker = self.clone();
        router.register(
            OperationCode::UpdateTaskStatus,
            handler_fn(move |env, msg| {
                let tracker = tracker.clone();
                async move {
                    match msg.decode::<TaskStatusUpdate>() {
                        Ok(update) => tracker.on_status(update),
                        Err(e) => warn!(from = %env.from, error = %e, "bad task status payload"),
                    }
                }
            }),
        );
        let tracker = self.clone();
        router.register(
            OperationCode::InsertLogs,
            handler_fn(move |env, msg| {
                let tracker = tracker.clone();
                async move {
                    match msg.decode::<LogBatch>() {
                        Ok(batch) => tracker.on_logs(batch),
                        Err(e) => warn!(from = %env.from, error = %e, "bad log payload"),
                    }
                }
            }),
        );
    }
}
