//! Workspace snapshots used for install-from-config-file.

use crate::error::WorkspaceError;
use crate::models::Ecosystem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

#[async_trait]
pub trait Workspace: Send + Sync {
    /// Makes the snapshot identified by `reference` available locally and
    /// returns its directory.
    async fn sync(&self, reference: &str) -> Result<PathBuf, WorkspaceError>;
}

/// Snapshots already present under a local root, one directory per reference.
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn sync(&self, reference: &str) -> Result<PathBuf, WorkspaceError> {
        let rel = Path::new(reference);
        let plain = !reference.is_empty()
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(WorkspaceError::InvalidReference(reference.to_string()));
        }
        let dir = self.root.join(rel);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(WorkspaceError::NotFound(reference.to_string()));
        }
        Ok(dir)
    }
}

/// Path of the ecosystem's dependency manifest in `dir`, if it exists.
pub fn config_file(dir: &Path, ecosystem: Ecosystem) -> Result<PathBuf, WorkspaceError> {
    let path = dir.join(ecosystem.config_file());
    if path.is_file() {
        Ok(path)
    } else {
        Err(WorkspaceError::MissingConfig {
            file: ecosystem.config_file(),
            dir: dir.display().to_string(),
        })
    }
}

/// Ecosystems whose manifest is present in `dir`.
pub fn detect_ecosystems(dir: &Path) -> Vec<Ecosystem> {
    Ecosystem::ALL
        .into_iter()
        .filter(|eco| dir.join(eco.config_file()).is_file())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub operator: Option<String>,
    pub version: Option<String>,
}

const OPERATORS: [&str; 7] = ["===", "==", ">=", "<=", "~=", "!=", ">"];

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn parse_requirement(line: &str) -> Option<Requirement> {
    // environment markers and extras are not interpreted
    let line = line.split(';').next().unwrap_or(line).trim();
    let split = line
        .char_indices()
        .find(|(_, c)| matches!(c, '=' | '<' | '>' | '~' | '!'))
        .map(|(i, _)| i);
    let Some(at) = split else {
        return valid_name(line).then(|| Requirement {
            name: line.to_string(),
            operator: None,
            version: None,
        });
    };
    let (name, rest) = line.split_at(at);
    let name = name.trim();
    let op = OPERATORS
        .iter()
        .chain(std::iter::once(&"<"))
        .find(|op| rest.starts_with(**op))?;
    let version = rest[op.len()..].trim();
    if !valid_name(name) || version.is_empty() {
        return None;
    }
    Some(Requirement {
        name: name.to_string(),
        operator: Some(op.to_string()),
        version: Some(version.to_string()),
    })
}

/// Parses `requirements.txt`. Blank lines, comments and pip options
/// (`-r`, `--index-url`, ...) are skipped; anything else unparseable fails
/// with its 1-based line number.
pub fn parse_requirements(text: &str) -> Result<Vec<Requirement>, WorkspaceError> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.split(" #").next().unwrap_or(raw).trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
            continue;
        }
        match parse_requirement(line) {
            Some(req) => out.push(req),
            None => {
                return Err(WorkspaceError::InvalidRequirement {
                    line: idx + 1,
                    content: raw.to_string(),
                })
            }
        }
    }
    Ok(out)
}

/// Reads `dependencies` of a `package.json`. A range like `^4.17.21` becomes
/// operator `^` and version `4.17.21`; `*`, `latest` and tags carry no version.
pub fn parse_package_json(text: &str) -> Result<Vec<Requirement>, WorkspaceError> {
    let invalid = |reason: String| WorkspaceError::InvalidManifest {
        file: Ecosystem::Node.config_file(),
        reason,
    };
    let manifest: serde_json::Value = serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;
    let Some(deps) = manifest.get("dependencies") else {
        return Ok(Vec::new());
    };
    let deps = deps
        .as_object()
        .ok_or_else(|| invalid("`dependencies` is not an object".into()))?;

    let mut out = Vec::with_capacity(deps.len());
    for (name, range) in deps {
        let range = range
            .as_str()
            .ok_or_else(|| invalid(format!("version of {name} is not a string")))?
            .trim();
        let at = range.find(|c: char| c.is_ascii_digit()).unwrap_or(range.len());
        let (operator, version) = range.split_at(at);
        let version = version.split_whitespace().next().unwrap_or_default();
        let (operator, version) = if version.is_empty() {
            (None, None)
        } else if operator.is_empty() {
            (Some("==".to_string()), Some(version.to_string()))
        } else {
            (Some(operator.trim().to_string()), Some(version.to_string()))
        };
        out.push(Requirement {
            name: name.clone(),
            operator,
            version,
        });
    }
    Ok(out)
}

/// Requirements declared by the ecosystem's manifest in `dir`.
pub async fn read_manifest(dir: &Path, ecosystem: Ecosystem) -> Result<Vec<Requirement>, WorkspaceError> {
    let text = tokio::fs::read_to_string(config_file(dir, ecosystem)?).await?;
    match ecosystem {
        Ecosystem::Python => parse_requirements(&text),
        Ecosystem::Node => parse_package_json(&text),
    }
}
