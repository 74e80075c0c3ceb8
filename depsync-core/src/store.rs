//! In-memory document collections with optional JSON snapshots.
//!
//! Every mutation persists the whole collection before it becomes visible,
//! so a failed write leaves memory and disk unchanged.

use crate::error::StoreError;
use crate::models::{Dependency, Ecosystem, LogEntry, Node, Setting, Task};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

/// Retention of tasks and logs.
pub const RETENTION: time::Duration = time::Duration::hours(24);

pub trait Document: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;
    fn id(&self) -> Uuid;
}

impl Document for Setting {
    const COLLECTION: &'static str = "settings";
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Document for Dependency {
    const COLLECTION: &'static str = "dependencies";
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Document for Task {
    const COLLECTION: &'static str = "tasks";
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Document for LogEntry {
    const COLLECTION: &'static str = "logs";
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Document for Node {
    const COLLECTION: &'static str = "nodes";
    fn id(&self) -> Uuid {
        self.id
    }
}

pub struct Collection<T: Document> {
    docs: Mutex<Vec<T>>,
    path: Option<PathBuf>,
}

impl<T: Document> Collection<T> {
    pub fn in_memory() -> Self {
        Self {
            docs: Mutex::new(Vec::new()),
            path: None,
        }
    }

    /// Loads the snapshot at `path` if present.
    pub fn persistent(path: PathBuf) -> Result<Self, StoreError> {
        let docs = if path.exists() {
            let raw = std::fs::read(&path)?;
            let docs: Vec<T> = serde_json::from_slice(&raw)?;
            info!(collection = T::COLLECTION, count = docs.len(), "loaded snapshot");
            docs
        } else {
            Vec::new()
        };
        Ok(Self {
            docs: Mutex::new(docs),
            path: Some(path),
        })
    }

    fn persist(&self, docs: &[T]) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(docs)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn find(&self, filter: impl Fn(&T) -> bool) -> Vec<T> {
        self.docs.lock().iter().filter(|d| filter(d)).cloned().collect()
    }

    pub fn find_one(&self, filter: impl Fn(&T) -> bool) -> Option<T> {
        self.docs.lock().iter().find(|d| filter(d)).cloned()
    }

    pub fn get(&self, id: Uuid) -> Option<T> {
        self.find_one(|d| d.id() == id)
    }

    pub fn all(&self) -> Vec<T> {
        self.docs.lock().clone()
    }

    pub fn count(&self, filter: impl Fn(&T) -> bool) -> usize {
        self.docs.lock().iter().filter(|d| filter(d)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.lock().is_empty()
    }

    /// Runs `f` against a working copy; commits only if `f` and the
    /// snapshot write both succeed.
    pub fn transaction<R, E>(&self, f: impl FnOnce(&mut Vec<T>) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut guard = self.docs.lock();
        let mut working = guard.clone();
        let out = f(&mut working)?;
        self.persist(&working)?;
        *guard = working;
        Ok(out)
    }

    pub fn insert(&self, doc: T) -> Result<(), StoreError> {
        self.transaction(|docs| {
            if docs.iter().any(|d| d.id() == doc.id()) {
                return Err(StoreError::Duplicate(doc.id(), T::COLLECTION));
            }
            docs.push(doc);
            Ok(())
        })
    }

    pub fn insert_many(&self, new: Vec<T>) -> Result<(), StoreError> {
        if new.is_empty() {
            return Ok(());
        }
        self.transaction(|docs| {
            for doc in &new {
                if docs.iter().any(|d| d.id() == doc.id()) {
                    return Err(StoreError::Duplicate(doc.id(), T::COLLECTION));
                }
            }
            docs.extend(new);
            Ok(())
        })
    }

    /// Applies `f` to the document with `id`. Returns the updated copy, or
    /// `None` when absent.
    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut T)) -> Result<Option<T>, StoreError> {
        self.transaction(|docs| {
            Ok(docs.iter_mut().find(|d| d.id() == id).map(|d| {
                f(d);
                d.clone()
            }))
        })
    }

    pub fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.delete_where(|d| d.id() == id)? > 0)
    }

    pub fn delete_where(&self, filter: impl Fn(&T) -> bool) -> Result<usize, StoreError> {
        self.transaction(|docs| {
            let before = docs.len();
            docs.retain(|d| !filter(d));
            Ok(before - docs.len())
        })
    }
}

pub struct Store {
    pub settings: Collection<Setting>,
    pub dependencies: Collection<Dependency>,
    pub tasks: Collection<Task>,
    pub logs: Collection<LogEntry>,
    pub nodes: Collection<Node>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            settings: Collection::in_memory(),
            dependencies: Collection::in_memory(),
            tasks: Collection::in_memory(),
            logs: Collection::in_memory(),
            nodes: Collection::in_memory(),
        }
    }

    /// One snapshot file per collection under `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let file = |name: &str| dir.join(format!("{name}.json"));
        Ok(Self {
            settings: Collection::persistent(file(Setting::COLLECTION))?,
            dependencies: Collection::persistent(file(Dependency::COLLECTION))?,
            tasks: Collection::persistent(file(Task::COLLECTION))?,
            logs: Collection::persistent(file(LogEntry::COLLECTION))?,
            nodes: Collection::persistent(file(Node::COLLECTION))?,
        })
    }

    /// Seeds one enabled setting per ecosystem when none exist yet.
    pub fn seed_default_settings(&self) -> Result<usize, StoreError> {
        if !self.settings.is_empty() {
            return Ok(0);
        }
        let defaults: Vec<Setting> = Ecosystem::ALL.into_iter().map(Setting::defaults_for).collect();
        let n = defaults.len();
        self.settings.insert_many(defaults)?;
        info!(count = n, "seeded default settings");
        Ok(n)
    }

    pub fn setting_for(&self, ecosystem: Ecosystem) -> Option<Setting> {
        self.settings.find_one(|s| s.key == ecosystem)
    }

    /// Deletes tasks and logs whose `update_ts` is older than `retention`.
    pub fn purge_expired(
        &self,
        now: OffsetDateTime,
        retention: time::Duration,
    ) -> Result<(usize, usize), StoreError> {
        let cutoff = now - retention;
        let tasks = self.tasks.delete_where(|t| t.update_ts < cutoff)?;
        let logs = self.logs.delete_where(|l| l.update_ts < cutoff)?;
        if tasks + logs > 0 {
            info!(tasks, logs, "purged expired records");
        }
        Ok((tasks, logs))
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskAction, TaskStatus};

    fn task_at(ts: OffsetDateTime) -> Task {
        Task {
            id: Uuid::new_v4(),
            setting_id: Uuid::new_v4(),
            ecosystem: Ecosystem::Python,
            node_id: Uuid::new_v4(),
            names: vec!["requests".into()],
            action: TaskAction::Install,
            status: TaskStatus::Running,
            error: None,
            update_ts: ts,
        }
    }

    #[test]
    fn test_seed_only_when_empty() {
        let store = Store::in_memory();
        assert_eq!(store.seed_default_settings().unwrap(), 2);
        assert_eq!(store.seed_default_settings().unwrap(), 0);
        assert_eq!(store.setting_for(Ecosystem::Node).unwrap().resolved_command(), "npm");
    }

    #[test]
    fn test_failed_transaction_leaves_collection_untouched() {
        let store = Store::in_memory();
        let t = task_at(OffsetDateTime::now_utc());
        store.tasks.insert(t.clone()).unwrap();

        let res: Result<(), StoreError> = store.tasks.transaction(|docs| {
            docs.clear();
            Err(StoreError::Duplicate(t.id, "tasks"))
        });
        assert!(res.is_err());
        assert_eq!(store.tasks.count(|_| true), 1);
        assert!(store.tasks.insert(t).is_err());
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.seed_default_settings().unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.settings.count(|_| true), 2);
        assert_eq!(store.seed_default_settings().unwrap(), 0);
    }

    #[test]
    fn test_purge_drops_only_expired() {
        let store = Store::in_memory();
        let now = OffsetDateTime::now_utc();
        store.tasks.insert(task_at(now - time::Duration::hours(25))).unwrap();
        store.tasks.insert(task_at(now - time::Duration::hours(1))).unwrap();
        let (tasks, logs) = store.purge_expired(now, RETENTION).unwrap();
        assert_eq!((tasks, logs), (1, 0));
        assert_eq!(store.tasks.count(|_| true), 1);
    }
}
