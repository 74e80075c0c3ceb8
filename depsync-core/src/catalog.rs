//! Cluster-wide view of installed dependencies, grouped by package name.

use crate::error::WorkspaceError;
use crate::models::{Dependency, Ecosystem};
use crate::store::Store;
use crate::workspace::{detect_ecosystems, read_manifest, Requirement, Workspace};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstalledEntry {
    pub name: String,
    pub node_ids: Vec<Uuid>,
    pub versions: Vec<String>,
    pub latest_version: Option<String>,
    pub upgradable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogPage {
    pub data: Vec<InstalledEntry>,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct CatalogQuery {
    pub query: Option<String>,
    pub page: usize,
    pub size: usize,
}

impl Default for CatalogQuery {
    fn default() -> Self {
        Self {
            query: None,
            page: 1,
            size: 10,
        }
    }
}

/// Compares dotted versions numerically, segment by segment. Non-numeric
/// suffixes (`rc1`, `-beta`) are ignored within a segment.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn segments(v: &str) -> Vec<u64> {
        v.trim_start_matches('v')
            .split(['.', '-', '+'])
            .map(|s| {
                let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    }
    let (a, b) = (segments(a), segments(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn group(rows: Vec<Dependency>) -> Vec<InstalledEntry> {
    let mut by_name: BTreeMap<String, InstalledEntry> = BTreeMap::new();
    for dep in rows {
        let entry = by_name.entry(dep.name.clone()).or_insert_with(|| InstalledEntry {
            name: dep.name.clone(),
            node_ids: Vec::new(),
            versions: Vec::new(),
            latest_version: None,
            upgradable: false,
        });
        entry.node_ids.push(dep.node_id);
        if !entry.versions.contains(&dep.version) {
            entry.versions.push(dep.version);
        }
        if entry.latest_version.is_none() {
            entry.latest_version = dep.latest_version;
        }
    }
    by_name
        .into_values()
        .map(|mut e| {
            e.upgradable = e.latest_version.as_deref().is_some_and(|latest| {
                e.versions
                    .iter()
                    .any(|v| compare_versions(latest, v) == Ordering::Greater)
            });
            e
        })
        .collect()
}

pub fn installed(store: &Store, ecosystem: Ecosystem, q: &CatalogQuery) -> CatalogPage {
    let needle = q.query.as_deref().map(str::to_lowercase).filter(|s| !s.is_empty());
    let rows = store.dependencies.find(|d| {
        d.ecosystem == ecosystem
            && needle
                .as_deref()
                .map_or(true, |n| d.name.to_lowercase().contains(n))
    });
    let entries = group(rows);
    let total = entries.len();
    let size = q.size.max(1);
    let data = entries
        .into_iter()
        .skip(q.page.saturating_sub(1).saturating_mul(size))
        .take(size)
        .collect();
    CatalogPage { data, total }
}

/// One declared requirement joined with what the cluster has installed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequirementCheck {
    #[serde(flatten)]
    pub requirement: Requirement,
    pub installed: Option<InstalledEntry>,
    /// Every installed version meets the constraint.
    pub satisfied: bool,
    pub upgradable: bool,
    pub downgradable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInspection {
    pub reference: String,
    pub ecosystem: Option<Ecosystem>,
    pub requirements: Vec<RequirementCheck>,
}

fn meets(op: &str, ord: Ordering) -> bool {
    match op {
        "==" | "===" => ord == Ordering::Equal,
        ">=" | "~=" | "^" | "~" => ord != Ordering::Less,
        ">" => ord == Ordering::Greater,
        "<=" => ord != Ordering::Greater,
        "<" => ord == Ordering::Less,
        "!=" => ord != Ordering::Equal,
        _ => true,
    }
}

fn check(requirement: Requirement, installed: Option<InstalledEntry>) -> RequirementCheck {
    let versions = installed.as_ref().map(|e| e.versions.as_slice()).unwrap_or_default();
    let constraint = requirement.operator.as_deref().zip(requirement.version.as_deref());
    let (mut satisfied, mut upgradable, mut downgradable) = (!versions.is_empty(), false, false);
    if let Some((op, required)) = constraint {
        for v in versions {
            let ord = compare_versions(v, required);
            satisfied &= meets(op, ord);
            upgradable |= ord == Ordering::Less && matches!(op, "==" | "===" | ">=" | ">" | "~=" | "^" | "~");
            downgradable |= ord == Ordering::Greater && matches!(op, "==" | "===" | "<=" | "<");
        }
    }
    RequirementCheck {
        requirement,
        installed,
        satisfied,
        upgradable,
        downgradable,
    }
}

/// Joins `requirements` against the installed rows of `ecosystem`. Python
/// names match case-insensitively.
pub fn check_requirements(
    store: &Store,
    ecosystem: Ecosystem,
    requirements: Vec<Requirement>,
) -> Vec<RequirementCheck> {
    let fold = |name: &str| match ecosystem {
        Ecosystem::Python => name.to_ascii_lowercase(),
        Ecosystem::Node => name.to_string(),
    };
    let wanted: Vec<String> = requirements.iter().map(|r| fold(&r.name)).collect();
    let rows = store
        .dependencies
        .find(|d| d.ecosystem == ecosystem && wanted.contains(&fold(&d.name)));
    let by_name: BTreeMap<String, InstalledEntry> =
        group(rows).into_iter().map(|e| (fold(&e.name), e)).collect();
    requirements
        .into_iter()
        .map(|r| {
            let installed = by_name.get(&fold(&r.name)).cloned();
            check(r, installed)
        })
        .collect()
}

/// Syncs the workspace, picks its manifest (`requirements.txt` first) and
/// checks every requirement against the cluster.
pub async fn inspect_workspace(
    store: &Store,
    workspace: &dyn Workspace,
    reference: &str,
) -> Result<WorkspaceInspection, WorkspaceError> {
    let dir = workspace.sync(reference).await?;
    let ecosystem = detect_ecosystems(&dir).into_iter().next();
    let requirements = match ecosystem {
        Some(eco) => check_requirements(store, eco, read_manifest(&dir, eco).await?),
        None => Vec::new(),
    };
    Ok(WorkspaceInspection {
        reference: reference.to_string(),
        ecosystem,
        requirements,
    })
}
