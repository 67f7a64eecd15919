//! Wire protocol types for the supervisor channel.
//!
//! Every frame carries one [`Message`] envelope. The envelope field names
//! (`messageId`, `messageType`) match what the supervising peer emits.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::limits::ResourceLimits;

/// Payload of a `heartbeat_response`.
pub const HEARTBEAT_REPLY: &str = "pong";

/// `source` marker stamped on everything a workload emits.
pub const EMIT_SOURCE: &str = "workload";

static SEND_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Message classes understood by the runtime.
///
/// Names the runtime does not know decode to [`MessageType::Other`] so a
/// single unexpected frame never tears down the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Heartbeat,
    HeartbeatResponse,
    Command,
    CommandResponse,
    Data,
    Connection,
    Disconnect,
    ScriptStatus,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatResponse => "heartbeat_response",
            Self::Command => "command",
            Self::CommandResponse => "command_response",
            Self::Data => "data",
            Self::Connection => "connection",
            Self::Disconnect => "disconnect",
            Self::ScriptStatus => "script_status",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "heartbeat" => Self::Heartbeat,
            "heartbeat_response" => Self::HeartbeatResponse,
            "command" => Self::Command,
            "command_response" => Self::CommandResponse,
            "data" => Self::Data,
            "connection" => Self::Connection,
            "disconnect" => Self::Disconnect,
            "script_status" => Self::ScriptStatus,
            _ => Self::Other(name),
        }
    }
}

impl From<&str> for MessageType {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One framed unit on the wire. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "messageId", default)]
    id: String,
    #[serde(rename = "messageType")]
    kind: MessageType,
    #[serde(default)]
    payload: Value,
    #[serde(default, deserialize_with = "timestamp_text")]
    timestamp: String,
}

impl Message {
    /// Build an outbound message with a fresh id and timestamp.
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            id: next_message_id(),
            kind,
            payload,
            timestamp: now_timestamp(),
        }
    }

    /// Rebuild a message from its parts, e.g. on the peer side of a test.
    pub fn from_parts(
        id: impl Into<String>,
        kind: MessageType,
        payload: Value,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
            timestamp: timestamp.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }
}

/// `rs-{pid}-{epoch_millis}-{seq}`; the sequence keeps ids unique within a millisecond.
pub fn next_message_id() -> String {
    let seq = SEND_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "rs-{}-{}-{}",
        std::process::id(),
        Utc::now().timestamp_millis(),
        seq
    )
}

/// Current UTC time as ISO-8601 with microseconds.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// Some peers write timestamps as a number of epoch seconds.
fn timestamp_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "timestamp must be a string or number, got {other}"
        ))),
    }
}

/// Payload of `connection` and `disconnect` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LinkStatus {
    Connected { pid: u32 },
    Disconnecting,
}

/// Commands the supervisor may issue inside a `command` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Status,
    /// Object payload whose `type` is missing or not recognised.
    Unknown(Option<String>),
}

impl Command {
    /// Returns `None` when the payload is not an object at all.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let obj = payload.as_object()?;
        let command = match obj.get("type").and_then(Value::as_str) {
            Some("ping") => Self::Ping,
            Some("status") => Self::Status,
            Some(other) => Self::Unknown(Some(other.to_string())),
            None => Self::Unknown(None),
        };
        Some(command)
    }
}

/// Replies sent as `command_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandReply {
    Pong {
        status: String,
    },
    StatusResponse {
        pid: u32,
        status: String,
        resource_limits: ResourceLimits,
        message_queue_size: usize,
    },
}

impl CommandReply {
    pub fn pong() -> Self {
        Self::Pong {
            status: "ok".to_string(),
        }
    }

    pub fn status(resource_limits: ResourceLimits, message_queue_size: usize) -> Self {
        Self::StatusResponse {
            pid: std::process::id(),
            status: "running".to_string(),
            resource_limits,
            message_queue_size,
        }
    }
}

/// Lifecycle events for the running workload, sent as `script_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScriptStatus {
    Loading {
        script_path: String,
        args: Map<String, Value>,
    },
    Executing {
        script_path: String,
    },
    Completed {
        script_path: String,
        exit_code: i32,
    },
    Exited {
        script_path: String,
        exit_code: i32,
    },
    Failed {
        script_path: String,
        error: String,
        traceback: Option<String>,
    },
}

impl ScriptStatus {
    pub fn loading(path: &Path, args: &Map<String, Value>) -> Self {
        Self::Loading {
            script_path: path.display().to_string(),
            args: args.clone(),
        }
    }

    pub fn executing(path: &Path) -> Self {
        Self::Executing {
            script_path: path.display().to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Loading { .. } => "loading",
            Self::Executing { .. } => "executing",
            Self::Completed { .. } => "completed",
            Self::Exited { .. } => "exited",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Envelope for data a workload emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitPayload {
    pub source: String,
    pub data: Value,
    pub timestamp: String,
}

impl EmitPayload {
    pub fn new(data: Value) -> Self {
        Self {
            source: EMIT_SOURCE.to_string(),
            data,
            timestamp: now_timestamp(),
        }
    }
}
