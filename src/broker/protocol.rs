//! WebSocket wire protocol
//!
//! Inbound messages are validated once here; handlers only ever see a
//! [`ClientMessage`]. Outbound events are stamped with the server time when
//! encoded.

use crate::error::now_millis;
use crate::git::{Branch, GitSnapshot};
use crate::session::ConversationEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tags accepted from clients, in dispatch order
pub const VALID_TYPES: &[&str] = &[
    "prompt",
    "new_session",
    "stop",
    "discard_changes",
    "list_branches",
    "switch_branch",
    "create_branch",
];

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Prompt {
        content: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        image_paths: Option<Vec<String>>,
    },
    NewSession {},
    Stop {},
    DiscardChanges {},
    ListBranches {},
    #[serde(rename_all = "camelCase")]
    SwitchBranch { branch_name: String },
    #[serde(rename_all = "camelCase")]
    CreateBranch { branch_name: String },
}

/// Why an inbound frame was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidJson,
    Unsupported(String),
}

impl ProtocolError {
    /// Text sent back to the client in an `error` event
    pub fn message(&self) -> String {
        match self {
            Self::InvalidJson => "Invalid JSON message".to_string(),
            Self::Unsupported(detail) => {
                format!("{}. Valid types: {}", detail, VALID_TYPES.join(", "))
            }
        }
    }
}

/// Parse and validate one inbound text frame
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;

    let tag = value.get("type").and_then(Value::as_str).map(str::to_string);
    match tag {
        Some(tag) if VALID_TYPES.contains(&tag.as_str()) => serde_json::from_value(value)
            .map_err(|e| ProtocolError::Unsupported(format!("Invalid {} message: {}", tag, e))),
        Some(tag) => Err(ProtocolError::Unsupported(format!(
            "Unknown message type: {}",
            tag
        ))),
        None => Err(ProtocolError::Unsupported(
            "Message is missing a string \"type\" field".to_string(),
        )),
    }
}

/// Broker activity reported in `status` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerStatus {
    Connected,
    Processing,
    Idle,
}

/// Lifecycle phase reported in `tool` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Started,
    Completed,
    Failed,
}

/// Events sent to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        status: BrokerStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Stream {
        prompt_id: String,
        chunk: String,
        done: bool,
    },
    #[serde(rename_all = "camelCase")]
    Tool {
        prompt_id: String,
        tool_name: String,
        status: ToolPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Result {
        prompt_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt_id: Option<String>,
        message: String,
    },
    History {
        entries: Vec<ConversationEntry>,
    },
    GitStatus(GitSnapshot),
    BranchesList {
        branches: Vec<Branch>,
    },
    #[serde(rename_all = "camelCase")]
    BranchSwitched {
        branch_name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    BranchCreated {
        branch_name: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StashConflict { branch_name: String, message: String },
    SessionCleared {},
    Stopped {},
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    event: &'a ServerEvent,
    timestamp: i64,
}

impl ServerEvent {
    pub fn status(status: BrokerStatus, prompt_id: Option<String>) -> Self {
        Self::Status { status, prompt_id }
    }

    pub fn error(prompt_id: Option<String>, message: impl Into<String>) -> Self {
        Self::Error {
            prompt_id,
            message: message.into(),
        }
    }

    /// Wire tag of this event
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Stream { .. } => "stream",
            Self::Tool { .. } => "tool",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::History { .. } => "history",
            Self::GitStatus(_) => "git_status",
            Self::BranchesList { .. } => "branches_list",
            Self::BranchSwitched { .. } => "branch_switched",
            Self::BranchCreated { .. } => "branch_created",
            Self::StashConflict { .. } => "stash_conflict",
            Self::SessionCleared {} => "session_cleared",
            Self::Stopped {} => "stopped",
        }
    }

    /// JSON text frame with the current timestamp
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&Envelope {
            event: self,
            timestamp: now_millis(),
        })
    }
}
