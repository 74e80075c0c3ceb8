use super::process::{capture, run_logged, CommandSpec};
use super::{InstallPlan, InstallTarget, PackageManager, PackageSummary};
use crate::error::ManagerError;
use crate::log_relay::LogRelay;
use crate::models::{Ecosystem, InstalledPackage};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

pub const NPM_REGISTRY: &str = "https://registry.npmjs.org";

/// Global npm packages, npm registry for metadata.
pub struct NpmManager {
    client: reqwest::Client,
    registry: String,
}

impl NpmManager {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_registry(client, NPM_REGISTRY)
    }

    pub fn with_registry(client: reqwest::Client, registry: impl Into<String>) -> Self {
        Self {
            client,
            registry: registry.into().trim_end_matches('/').to_string(),
        }
    }

    fn package_url(&self, name: &str) -> String {
        // scoped names keep their @ but the slash is escaped
        format!("{}/{}", self.registry, name.replace('/', "%2F"))
    }
}

#[derive(Deserialize)]
struct NpmTree {
    #[serde(default)]
    dependencies: BTreeMap<String, NpmTreeEntry>,
}

#[derive(Deserialize)]
struct NpmTreeEntry {
    #[serde(default)]
    version: Option<String>,
}

/// Parses `npm ls -g --json --depth=0`. Entries without a version
/// (missing or invalid installs) are skipped.
pub fn parse_npm_ls(stdout: &[u8]) -> Result<Vec<InstalledPackage>, ManagerError> {
    let tree: NpmTree = serde_json::from_slice(stdout).map_err(|e| ManagerError::Output {
        program: "npm".into(),
        reason: e.to_string(),
    })?;
    Ok(tree
        .dependencies
        .into_iter()
        .filter_map(|(name, entry)| entry.version.map(|version| InstalledPackage { name, version }))
        .collect())
}

pub fn install_args(plan: &InstallPlan) -> Vec<String> {
    let mut args = vec!["install".to_string()];
    match &plan.target {
        InstallTarget::ConfigFile(path) => {
            let dir = path.parent().map(|p| p.display().to_string()).unwrap_or_else(|| ".".into());
            args.push("--prefix".into());
            args.push(dir);
        }
        InstallTarget::Names(names) => {
            args.push("-g".into());
            args.extend(names.iter().map(|n| {
                if plan.upgrade {
                    format!("{n}@latest")
                } else {
                    n.clone()
                }
            }));
        }
    }
    if let Some(proxy) = &plan.proxy {
        args.push("--registry".into());
        args.push(proxy.clone());
    }
    args
}

pub fn uninstall_args(names: &[String]) -> Vec<String> {
    let mut args = vec!["uninstall".to_string(), "-g".to_string()];
    args.extend(names.iter().cloned());
    args
}

#[derive(Deserialize)]
struct LatestManifest {
    version: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    objects: Vec<SearchObject>,
}

#[derive(Deserialize)]
struct SearchObject {
    package: SearchPackage,
}

#[derive(Deserialize)]
struct SearchPackage {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait]
impl PackageManager for NpmManager {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Node
    }

    async fn list(&self, command: &str) -> Result<Vec<InstalledPackage>, ManagerError> {
        let spec = CommandSpec::new(
            command,
            vec!["ls".into(), "-g".into(), "--json".into(), "--depth=0".into()],
        );
        // npm exits non-zero on peer-dependency problems but still prints the tree
        let out = capture(&spec).await?;
        parse_npm_ls(&out.stdout)
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
        let res = self
            .client
            .get(format!("{}/latest", self.package_url(name)))
            .send()
            .await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ManagerError::NotFound(name.to_string()));
        }
        let manifest: LatestManifest = res.error_for_status()?.json().await?;
        Ok(manifest.version)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<PackageSummary>, ManagerError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let size = limit.clamp(1, 250).to_string();
        let res: SearchResponse = self
            .client
            .get(format!("{}/-/v1/search", self.registry))
            .query(&[("text", query), ("size", size.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(res
            .objects
            .into_iter()
            .map(|o| PackageSummary {
                name: o.package.name,
                latest_version: o.package.version,
                description: o.package.description,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_npm_ls() {
        let raw = br#"{
            "name": "lib",
            "dependencies": {
                "typescript": {"version": "5.4.5"},
                "broken": {"missing": true},
                "yarn": {"version": "1.22.22"}
            }
        }"#;
        let pkgs = parse_npm_ls(raw).unwrap();
        let names: Vec<&str> = pkgs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["typescript", "yarn"]);
        assert!(parse_npm_ls(b"{}").unwrap().is_empty());
    }

    #[test]
    fn test_install_args_upgrade_pins_latest() {
        let plan = InstallPlan {
            command: "npm".into(),
            proxy: Some("https://registry.npmmirror.com".into()),
            upgrade: true,
            target: InstallTarget::Names(vec!["typescript".into()]),
        };
        assert_eq!(
            install_args(&plan),
            vec!["install", "-g", "typescript@latest", "--registry", "https://registry.npmmirror.com"]
        );
    }

    #[test]
    fn test_install_args_from_package_json() {
        let plan = InstallPlan {
            command: "npm".into(),
            proxy: None,
            upgrade: false,
            target: InstallTarget::ConfigFile(PathBuf::from("/ws/spider/package.json")),
        };
        assert_eq!(install_args(&plan), vec!["install", "--prefix", "/ws/spider"]);
    }

    #[test]
    fn test_scoped_package_url() {
        let m = NpmManager::with_registry(reqwest::Client::new(), "https://r.example/");
        assert_eq!(m.package_url("@types/node"), "https://r.example/@types%2Fnode");
    }
}
