use crate::models::{Ecosystem, TaskStatus};
use uuid::Uuid;

/// Failures of the envelope stream itself.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("gave up connecting after {0} attempts")]
    Exhausted(u32),
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("stream closed")]
    Closed,
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document {0} already exists in {1}")]
    Duplicate(Uuid, &'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error("invalid task transition {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by a package-manager capability.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} failed ({status})")]
    ExitStatus { program: String, status: String },
    #[error("{program} output could not be parsed: {reason}")]
    Output { program: String, reason: String },
    #[error("registry lookup failed: {0}")]
    Registry(String),
    #[error("package not found: {0}")]
    NotFound(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ManagerError {
    fn from(e: reqwest::Error) -> Self {
        ManagerError::Registry(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("invalid workspace reference: {0}")]
    InvalidReference(String),
    #[error("workspace not found: {0}")]
    NotFound(String),
    #[error("no {file} in workspace {dir}")]
    MissingConfig { file: &'static str, dir: String },
    #[error("invalid requirements.txt line {line}: {content}")]
    InvalidRequirement { line: usize, content: String },
    #[error("invalid {file}: {reason}")]
    InvalidManifest { file: &'static str, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Umbrella error for coordinator and agent operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("no setting for ecosystem {0}")]
    SettingMissing(Ecosystem),
    #[error("ecosystem {0} is disabled")]
    EcosystemDisabled(Ecosystem),
    #[error("no package manager for ecosystem {0}")]
    ManagerMissing(Ecosystem),
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}
