/*!
Scripted package manager

Keeps an in-memory set of installed packages. Installs emit a few output
lines through the task's `LogRelay` exactly like a real child process would.
*/

use async_trait::async_trait;
use depsync_core::ecosystem::{InstallPlan, InstallTarget, PackageManager, PackageSummary};
use depsync_core::log_relay::LogRelay;
use depsync_core::models::{Ecosystem, InstalledPackage};
use depsync_core::ManagerError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const FAKE_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    List { command: String },
    Install { plan: InstallPlan },
    Uninstall { command: String, names: Vec<String> },
}

pub struct FakeManager {
    ecosystem: Ecosystem,
    installed: Mutex<BTreeMap<String, String>>,
    calls: Mutex<Vec<FakeCall>>,
    fail_with: Mutex<Option<String>>,
    latest: Mutex<HashMap<String, String>>,
    lookups: AtomicUsize,
    output_lines: usize,
}

impl FakeManager {
    pub fn new(ecosystem: Ecosystem) -> Self {
        Self {
            ecosystem,
            installed: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
            latest: Mutex::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
            output_lines: 3,
        }
    }

    pub fn with_installed(self, names: &[&str]) -> Self {
        {
            let mut installed = self.installed.lock();
            for name in names {
                installed.insert(name.to_string(), FAKE_VERSION.to_string());
            }
        }
        self
    }

    /// Lines written to stdout per install; stderr always gets one more.
    pub fn with_output_lines(mut self, n: usize) -> Self {
        self.output_lines = n;
        self
    }

    pub fn with_latest(self, name: &str, version: &str) -> Self {
        self.latest.lock().insert(name.to_string(), version.to_string());
        self
    }

    /// Makes every following install and uninstall fail with `reason`.
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.fail_with.lock() = Some(reason.into());
    }

    pub fn installed(&self) -> Vec<String> {
        self.installed.lock().keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().clone()
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn failure(&self, program: &str) -> Result<(), ManagerError> {
        match self.fail_with.lock().clone() {
            Some(status) => Err(ManagerError::ExitStatus {
                program: program.to_string(),
                status,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PackageManager for FakeManager {
    fn ecosystem(&self) -> Ecosystem {
        self.ecosystem
    }

    async fn list(&self, command: &str) -> Result<Vec<InstalledPackage>, ManagerError> {
        self.calls.lock().push(FakeCall::List {
            command: command.to_string(),
        });
        Ok(self
            .installed
            .lock()
            .iter()
            .map(|(name, version)| InstalledPackage {
                name: name.clone(),
                version: version.clone(),
            })
            .collect())
    }

    async fn install(&self, plan: &InstallPlan, relay: &LogRelay) -> Result<(), ManagerError> {
        self.calls.lock().push(FakeCall::Install { plan: plan.clone() });
        let stdout: String = (0..self.output_lines)
            .map(|i| format!("{} install step {i}\n", plan.command))
            .collect();
        let stderr = format!("{}: notice\n", plan.command);
        let relayed = relay.attach(Cursor::new(stdout.into_bytes()), Cursor::new(stderr.into_bytes()));
        relayed
            .await
            .map_err(|e| ManagerError::Io(std::io::Error::other(e)))?;
        self.failure(&plan.command)?;

        let mut installed = self.installed.lock();
        match &plan.target {
            InstallTarget::Names(names) => {
                for name in names {
                    installed.insert(name.clone(), FAKE_VERSION.to_string());
                }
            }
            InstallTarget::ConfigFile(path) => {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                installed.insert(name, FAKE_VERSION.to_string());
            }
        }
        Ok(())
    }

    async fn uninstall(
        &self,
        command: &str,
        names: &[String],
        _relay: &LogRelay,
    ) -> Result<(), ManagerError> {
        self.calls.lock().push(FakeCall::Uninstall {
            command: command.to_string(),
            names: names.to_vec(),
        });
        self.failure(command)?;
        let mut installed = self.installed.lock();
        for name in names {
            installed.remove(name);
        }
        Ok(())
    }

    async fn latest_version(&self, name: &str) -> Result<String, ManagerError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.latest
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<PackageSummary>, ManagerError> {
        Ok(self
            .latest
            .lock()
            .iter()
            .filter(|(name, _)| name.contains(query))
            .take(limit)
            .map(|(name, version)| PackageSummary {
                name: name.clone(),
                latest_version: Some(version.clone()),
                description: None,
            })
            .collect())
    }
}
