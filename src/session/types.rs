//! Conversation and session types
//!
//! The JSON shape of [`ConversationEntry`] is shared with clients (the
//! `history` event) and with the on-disk session file.

use crate::error::now_millis;
use serde::{Deserialize, Serialize};

/// Outcome of a tool call recorded in history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Completed,
    Failed,
}

/// Kind of a system entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Error,
    Stopped,
}

/// One entry of the conversation history, tagged by `role`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ConversationEntry {
    #[serde(rename_all = "camelCase")]
    User {
        content: String,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_paths: Option<Vec<String>>,
    },
    Assistant {
        content: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Tool {
        tool_name: String,
        status: ToolStatus,
        #[serde(default)]
        input: serde_json::Value,
        #[serde(default)]
        output: serde_json::Value,
        timestamp: i64,
    },
    System {
        #[serde(rename = "type")]
        kind: SystemKind,
        content: String,
        timestamp: i64,
    },
}

impl ConversationEntry {
    pub fn user(content: impl Into<String>, image_paths: Option<Vec<String>>) -> Self {
        Self::User {
            content: content.into(),
            timestamp: now_millis(),
            image_paths: image_paths.filter(|paths| !paths.is_empty()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    pub fn tool(
        tool_name: impl Into<String>,
        status: ToolStatus,
        input: serde_json::Value,
        output: serde_json::Value,
    ) -> Self {
        Self::Tool {
            tool_name: tool_name.into(),
            status,
            input,
            output,
            timestamp: now_millis(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::System {
            kind: SystemKind::Error,
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    pub fn stopped() -> Self {
        Self::System {
            kind: SystemKind::Stopped,
            content: "Stopped by user".to_string(),
            timestamp: now_millis(),
        }
    }

    /// Text content of user, assistant and system entries
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::User { content, .. }
            | Self::Assistant { content, .. }
            | Self::System { content, .. } => Some(content),
            Self::Tool { .. } => None,
        }
    }
}

/// In-memory session state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    /// Engine-assigned id used to resume the conversation
    pub session_id: Option<String>,
    /// Ordered, append-only conversation history
    pub history: Vec<ConversationEntry>,
}

impl Session {
    /// Forget the session id and all history
    pub fn clear(&mut self) {
        self.session_id = None;
        self.history.clear();
    }

    pub fn push(&mut self, entry: ConversationEntry) {
        self.history.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_entry_serialization() {
        let entry = ConversationEntry::User {
            content: "add a button".to_string(),
            timestamp: 1,
            image_paths: Some(vec!["/tmp/a.png".to_string()]),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"], "add a button");
        assert_eq!(value["imagePaths"][0], "/tmp/a.png");
    }

    #[test]
    fn test_user_entry_without_images_omits_field() {
        let entry = ConversationEntry::user("hi", Some(vec![]));
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("imagePaths").is_none());
    }

    #[test]
    fn test_tool_entry_serialization() {
        let entry = ConversationEntry::tool(
            "Bash",
            ToolStatus::Failed,
            json!({"command": "ls"}),
            json!("permission denied"),
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["toolName"], "Bash");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["input"]["command"], "ls");
    }

    #[test]
    fn test_system_entry_uses_type_key() {
        let value = serde_json::to_value(ConversationEntry::stopped()).unwrap();
        assert_eq!(value["role"], "system");
        assert_eq!(value["type"], "stopped");
        assert_eq!(value["content"], "Stopped by user");
    }

    #[test]
    fn test_parse_legacy_entries() {
        let raw = json!([
            {"role": "user", "content": "hello", "timestamp": 10},
            {"role": "assistant", "content": "hi there", "timestamp": 11},
            {"role": "system", "type": "error", "content": "boom", "timestamp": 12}
        ]);
        let entries: Vec<ConversationEntry> = serde_json::from_value(raw).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].content(), Some("hi there"));
        assert!(matches!(
            entries[2],
            ConversationEntry::System {
                kind: SystemKind::Error,
                ..
            }
        ));
    }

    #[test]
    fn test_session_clear() {
        let mut session = Session {
            session_id: Some("s1".to_string()),
            history: vec![ConversationEntry::assistant("x")],
        };
        session.clear();
        assert_eq!(session, Session::default());
    }
}
