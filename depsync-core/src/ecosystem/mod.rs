//! Package-manager capabilities, one per ecosystem.
//!
//! The coordinator only uses [`PackageManager::latest_version`] and
//! [`PackageManager::search`]; nodes use the rest.

pub mod node;
pub mod process;
pub mod python;

use crate::error::ManagerError;
use crate::log_relay::LogRelay;
use crate::models::{Ecosystem, InstalledPackage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use node::NpmManager;
pub use python::PipManager;

pub const REGISTRY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallTarget {
    Names(Vec<String>),
    ConfigFile(PathBuf),
}

/// Fully resolved install request, ready to become a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub command: String,
    pub proxy: Option<String>,
    pub upgrade: bool,
    pub target: InstallTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSummary {
    pub name: String,
    pub latest_version: Option<String>,
    pub description: Option<String>,
}

#[async_trait]
pub trait PackageManager: Send + Sync {
    fn ecosystem(&self) -> Ecosystem;

    async fn list(&self, command: &str) -> Result<Vec<InstalledPackage>, ManagerError>;

    async fn install(&self, plan: &InstallPlan, relay: &LogRelay) -> Result<(), ManagerError>;

    async fn uninstall(
        &self,
        command: &str,
        names: &[String],
        relay: &LogRelay,
    ) -> Result<(), ManagerError>;

    async fn latest_version(&self, name: &str) -> Result<String, ManagerError>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<PackageSummary>, ManagerError>;
}

#[derive(Clone, Default)]
pub struct Managers {
    by_ecosystem: HashMap<Ecosystem, Arc<dyn PackageManager>>,
}

impl Managers {
    pub fn new() -> Self {
        Self::default()
    }

    /// pip and npm backed by the real executables and public registries.
    pub fn system(client: reqwest::Client) -> Self {
        Self::new()
            .with(Arc::new(PipManager::new(client.clone())))
            .with(Arc::new(NpmManager::new(client)))
    }

    pub fn with(mut self, manager: Arc<dyn PackageManager>) -> Self {
        self.by_ecosystem.insert(manager.ecosystem(), manager);
        self
    }

    pub fn get(&self, ecosystem: Ecosystem) -> Option<Arc<dyn PackageManager>> {
        self.by_ecosystem.get(&ecosystem).cloned()
    }

    pub fn ecosystems(&self) -> Vec<Ecosystem> {
        let mut ecos: Vec<Ecosystem> = self.by_ecosystem.keys().copied().collect();
        ecos.sort();
        ecos
    }
}

/// Shared HTTP client for registry lookups.
pub fn registry_client() -> Result<reqwest::Client, ManagerError> {
    reqwest::Client::builder()
        .timeout(REGISTRY_TIMEOUT)
        .user_agent(concat!("depsync/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(ManagerError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_managers_cover_both_ecosystems() {
        let managers = Managers::system(reqwest::Client::new());
        assert_eq!(managers.ecosystems(), vec![Ecosystem::Python, Ecosystem::Node]);
        assert_eq!(managers.get(Ecosystem::Node).unwrap().ecosystem(), Ecosystem::Node);
    }
}
