//! Wire format shared by master and nodes.
//!
//! Two levels of addressing: the outer [`Envelope`] routes between node keys,
//! the inner [`Message`] selects the logical handler by [`OperationCode`].
//! Both `data` fields are raw bytes, carried as base64 strings in JSON.

use crate::models::{Ecosystem, InstalledPackage, TaskStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamCode {
    Send,
    Connect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: StreamCode,
    /// Key of the node that emitted the envelope.
    pub node_key: String,
    pub from: String,
    pub to: String,
    #[serde(with = "b64", default)]
    pub data: Vec<u8>,
}

impl Envelope {
    /// Identity handshake sent right after a stream is opened.
    pub fn connect(identity: &str) -> Self {
        Self {
            code: StreamCode::Connect,
            node_key: identity.to_string(),
            from: identity.to_string(),
            to: String::new(),
            data: Vec::new(),
        }
    }

    pub fn send(from: &str, to: &str, message: &Message) -> Result<Self, serde_json::Error> {
        Ok(Self {
            code: StreamCode::Send,
            node_key: from.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            data: serde_json::to_vec(message)?,
        })
    }

    pub fn message(&self) -> Result<Message, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub code: OperationCode,
    #[serde(with = "b64", default)]
    pub data: Vec<u8>,
}

impl Message {
    pub fn new<T: Serialize>(code: OperationCode, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            code,
            data: serde_json::to_vec(payload)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

/// Per-ecosystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcosystemOp {
    Update,
    Save,
    Install,
    Uninstall,
}

impl EcosystemOp {
    pub const ALL: [EcosystemOp; 4] = [
        EcosystemOp::Update,
        EcosystemOp::Save,
        EcosystemOp::Install,
        EcosystemOp::Uninstall,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            EcosystemOp::Update => "update",
            EcosystemOp::Save => "save",
            EcosystemOp::Install => "install",
            EcosystemOp::Uninstall => "uninstall",
        }
    }
}

/// Inner operation id selecting the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum OperationCode {
    UpdateTaskStatus,
    InsertLogs,
    NodeHeartbeat,
    Ecosystem(Ecosystem, EcosystemOp),
}

impl fmt::Display for OperationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationCode::UpdateTaskStatus => f.write_str("update_task"),
            OperationCode::InsertLogs => f.write_str("insert_logs"),
            OperationCode::NodeHeartbeat => f.write_str("node_heartbeat"),
            OperationCode::Ecosystem(eco, op) => write!(f, "{}_{}", eco.as_str(), op.as_str()),
        }
    }
}

impl FromStr for OperationCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update_task" => return Ok(OperationCode::UpdateTaskStatus),
            "insert_logs" => return Ok(OperationCode::InsertLogs),
            "node_heartbeat" => return Ok(OperationCode::NodeHeartbeat),
            _ => {}
        }
        let (eco, op) = s
            .split_once('_')
            .ok_or_else(|| format!("unknown operation code: {s}"))?;
        let eco: Ecosystem = eco.parse()?;
        let op = EcosystemOp::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == op)
            .ok_or_else(|| format!("unknown operation code: {s}"))?;
        Ok(OperationCode::Ecosystem(eco, op))
    }
}

impl From<OperationCode> for String {
    fn from(code: OperationCode) -> Self {
        code.to_string()
    }
}

impl TryFrom<String> for OperationCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ===== Payloads =====

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub command: String,
}

pub type SaveDependencies = Vec<InstalledPackage>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    pub task_id: Uuid,
    #[serde(default)]
    pub upgrade: bool,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    pub command: String,
    #[serde(default)]
    pub use_config_file: bool,
    #[serde(default)]
    pub workspace_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UninstallRequest {
    pub task_id: Uuid,
    pub command: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBatch {
    pub task_id: Uuid,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub name: String,
    #[serde(default)]
    pub is_master: bool,
}

/// Best-effort extraction of `task_id` from a payload that failed to decode.
pub fn salvage_task_id(data: &[u8]) -> Option<Uuid> {
    let value: serde_json::Value = serde_json::from_slice(data).ok()?;
    value.get("task_id")?.as_str()?.parse().ok()
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes_parse_back() {
        let codes = [
            OperationCode::UpdateTaskStatus,
            OperationCode::InsertLogs,
            OperationCode::NodeHeartbeat,
            OperationCode::Ecosystem(Ecosystem::Python, EcosystemOp::Save),
            OperationCode::Ecosystem(Ecosystem::Node, EcosystemOp::Uninstall),
        ];
        for code in codes {
            assert_eq!(code.to_string().parse::<OperationCode>().unwrap(), code);
        }
        assert_eq!(
            OperationCode::Ecosystem(Ecosystem::Python, EcosystemOp::Install).to_string(),
            "python_install"
        );
        assert!("python_explode".parse::<OperationCode>().is_err());
        assert!("nonsense".parse::<OperationCode>().is_err());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let msg = Message::new(
            OperationCode::Ecosystem(Ecosystem::Python, EcosystemOp::Update),
            &UpdateRequest { command: "pip".into() },
        )
        .unwrap();
        let env = Envelope::send("master", "worker-1", &msg).unwrap();
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();

        assert_eq!(json["code"], "SEND");
        assert_eq!(json["node_key"], "master");
        assert_eq!(json["to"], "worker-1");
        assert!(json["data"].is_string());

        let back: Envelope = serde_json::from_value(json).unwrap();
        let inner = back.message().unwrap();
        assert_eq!(inner.code.to_string(), "python_update");
        let req: UpdateRequest = inner.decode().unwrap();
        assert_eq!(req.command, "pip");
    }

    #[test]
    fn test_salvage_task_id_from_partial_payload() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"task_id":"{id}","names":"not-a-list"}}"#);
        assert!(serde_json::from_str::<InstallRequest>(&raw).is_err());
        assert_eq!(salvage_task_id(raw.as_bytes()), Some(id));
        assert_eq!(salvage_task_id(b"garbage"), None);
    }
}
