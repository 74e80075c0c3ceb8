use super::process::{capture, run_logged, CommandSpec};
use super::{InstallPlan, InstallTarget, PackageManager, PackageSummary};
use crate::error::ManagerError;
use crate::log_relay::LogRelay;
use crate::models::{Ecosystem, InstalledPackage};
use async_trait::async_trait;
use serde::Deserialize;

pub const PYPI: &str = "https://pypi.org";

/// pip on the local interpreter, PyPI JSON API for metadata.
pub struct PipManager {
    client: reqwest::Client,
    index_url: String,
}

impl PipManager {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_index(client, PYPI)
    }

    pub fn with_index(client: reqwest::Client, index_url: impl Into<String>) -> Self {
        Self {
            client,
            index_url: index_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct PipListEntry {
    name: String,
    version: String,
}

/// Parses `pip list --format json`. Entries whose name starts with `-`
/// are broken installs and skipped.
pub fn parse_pip_list(stdout: &[u8]) -> Result<Vec<InstalledPackage>, ManagerError> {
    let entries: Vec<PipListEntry> =
        serde_json::from_slice(stdout).map_err(|e| ManagerError::Output {
            program: "pip".into(),
            reason: e.to_string(),
        })?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.name.starts_with('-'))
        .map(|e| InstalledPackage {
            name: e.name,
            version: e.version,
        })
        .collect())
}

pub fn install_args(plan: &InstallPlan) -> Vec<String> {
    let mut args = vec!["install".to_string()];
    if let Some(proxy) = &plan.proxy {
        args.push("-i".into());
        args.push(proxy.clone());
    }
    match &plan.target {
        InstallTarget::ConfigFile(path) => {
            args.push("-r".into());
            args.push(path.display().to_string());
        }
        InstallTarget::Names(names) => {
            if plan.upgrade {
                args.push("-U".into());
            }
            args.extend(names.iter().cloned());
        }
    }
    args
}

pub fn uninstall_args(names: &[String]) -> Vec<String> {
    let mut args = vec!["uninstall".to_string(), "-y".to_string()];
    args.extend(names.iter().cloned());
    args
}

#[derive(Deserialize)]
struct PypiProject {
    info: PypiInfo,
}

#[derive(Deserialize)]
struct PypiInfo {
    name: String,
    version: String,
    #[serde(default)]
    summary: Option<String>,
}

impl PipManager {
    async fn project(&self, name: &str) -> Result<PypiInfo, ManagerError> {
        let url = format!("{}/pypi/{}/json", self.index_url, name);
        let res = self.client.get(&url).send().await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ManagerError::NotFound(name.to_string()));
        }
        let project: PypiProject = res.error_for_status()?.json().await?;
        Ok(project.info)
    }
}

#[async_trait]
impl PackageManager for PipManager {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Python
    }

    async fn list(&self, command: &str) -> Result<Vec<InstalledPackage>, ManagerError> {
        let spec = CommandSpec::new(command, vec!["list".into(), "--format".into(), "json".into()]);
        let out = capture(&spec).await?;
        if !out.status.success() {
            return Err(ManagerError::ExitStatus {
                program: command.to_string(),
                status: out.status.to_string(),
            });
        }
        parse_pip_list(&out.stdout)
    }

    async fn install(&self, plan: &InstallPlan, relay: &LogRelay) -> Result<(), ManagerError> {
        run_logged(&CommandSpec::new(&plan.command, install_args(plan)), relay).await
    }

    async fn uninstall(
        &self,
        command: &str,
        names: &[String],
        relay: &LogRelay,
    ) -> Result<(), ManagerError> {
        run_logged(&CommandSpec::new(command, uninstall_args(names)), relay).await
    }

    async fn latest_version(&self, name: &str) -> Result<String, ManagerError> {
        Ok(self.project(name).await?.version)
    }

    /// PyPI has no JSON search endpoint; this is an exact-name lookup.
    async fn search(&self, query: &str, _limit: usize) -> Result<Vec<PackageSummary>, ManagerError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        match self.project(query).await {
            Ok(info) => Ok(vec![PackageSummary {
                name: info.name,
                latest_version: Some(info.version),
                description: info.summary,
            }]),
            Err(ManagerError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_pip_list_skips_broken_entries() {
        let raw = br#"[
            {"name": "requests", "version": "2.31.0"},
            {"name": "-rapy", "version": "0.0.0"},
            {"name": "urllib3", "version": "2.2.1"}
        ]"#;
        let pkgs = parse_pip_list(raw).unwrap();
        let names: Vec<&str> = pkgs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["requests", "urllib3"]);
        assert!(parse_pip_list(b"WARNING: not json").is_err());
    }

    #[test]
    fn test_install_args_by_name_with_proxy_and_upgrade() {
        let plan = InstallPlan {
            command: "pip".into(),
            proxy: Some("https://mirror.example/simple".into()),
            upgrade: true,
            target: InstallTarget::Names(vec!["requests".into(), "lxml".into()]),
        };
        assert_eq!(
            install_args(&plan),
            vec!["install", "-i", "https://mirror.example/simple", "-U", "requests", "lxml"]
        );
    }

    #[test]
    fn test_install_args_from_requirements_ignore_upgrade() {
        let plan = InstallPlan {
            command: "pip".into(),
            proxy: None,
            upgrade: true,
            target: InstallTarget::ConfigFile(PathBuf::from("/ws/requirements.txt")),
        };
        assert_eq!(install_args(&plan), vec!["install", "-r", "/ws/requirements.txt"]);
    }

    #[test]
    fn test_uninstall_args() {
        assert_eq!(
            uninstall_args(&["requests".into()]),
            vec!["uninstall", "-y", "requests"]
        );
    }
}
