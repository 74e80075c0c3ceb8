use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Package ecosystem handled by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Python,
    Node,
}

impl Ecosystem {
    pub const ALL: [Ecosystem; 2] = [Ecosystem::Python, Ecosystem::Node];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Python => "python",
            Ecosystem::Node => "node",
        }
    }

    /// Package-manager executable used when the setting has no override.
    pub fn default_command(&self) -> &'static str {
        match self {
            Ecosystem::Python => "pip",
            Ecosystem::Node => "npm",
        }
    }

    /// Dependency manifest looked up inside a workspace.
    pub fn config_file(&self) -> &'static str {
        match self {
            Ecosystem::Python => "requirements.txt",
            Ecosystem::Node => "package.json",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Ecosystem::Python => "Python",
            Ecosystem::Node => "Node.js",
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ecosystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Ecosystem::Python),
            "node" => Ok(Ecosystem::Node),
            other => Err(format!("unknown ecosystem: {other}")),
        }
    }
}

/// Installed package as reported by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

/// One installed dependency on one node. Unique per (ecosystem, node_id, name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: Uuid,
    pub ecosystem: Ecosystem,
    pub name: String,
    pub version: String,
    pub latest_version: Option<String>,
    pub node_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Install,
    Uninstall,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Finished,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub setting_id: Uuid,
    pub ecosystem: Ecosystem,
    pub node_id: Uuid,
    pub names: Vec<String>,
    pub action: TaskAction,
    pub status: TaskStatus,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub update_ts: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub update_ts: OffsetDateTime,
}

/// Per-ecosystem configuration consulted before every dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub id: Uuid,
    pub key: Ecosystem,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    pub enabled: bool,
}

impl Setting {
    pub fn defaults_for(key: Ecosystem) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            name: key.display_name().to_string(),
            description: Some(format!("settings.description.{key}")),
            command: Some(key.default_command().to_string()),
            proxy: None,
            enabled: true,
        }
    }

    /// Command override, or the ecosystem default when unset or blank.
    pub fn resolved_command(&self) -> String {
        match self.command.as_deref().map(str::trim) {
            Some(cmd) if !cmd.is_empty() => cmd.to_string(),
            _ => self.key.default_command().to_string(),
        }
    }

    pub fn resolved_proxy(&self) -> Option<String> {
        self.proxy
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
    }
}

/// Cluster member as seen by the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    /// Stable logical key; used for addressing and every keyed lookup.
    pub key: String,
    pub name: String,
    pub is_master: bool,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

impl Node {
    pub fn new(key: impl Into<String>, is_master: bool) -> Self {
        let key = key.into();
        Self {
            id: Uuid::new_v4(),
            name: key.clone(),
            key,
            is_master,
            active: true,
            last_seen: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecosystem_round_trips_through_str() {
        for eco in Ecosystem::ALL {
            assert_eq!(eco.as_str().parse::<Ecosystem>().unwrap(), eco);
        }
        assert!("ruby".parse::<Ecosystem>().is_err());
    }

    #[test]
    fn test_setting_command_falls_back_to_default() {
        let mut s = Setting::defaults_for(Ecosystem::Python);
        s.command = Some("  ".into());
        assert_eq!(s.resolved_command(), "pip");
        s.command = Some("/opt/py/bin/pip3".into());
        assert_eq!(s.resolved_command(), "/opt/py/bin/pip3");
        s.proxy = Some("".into());
        assert_eq!(s.resolved_proxy(), None);
    }

    #[test]
    fn test_only_running_is_not_terminal() {
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Finished.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
    }
}
