//! Conversation messages ingested from the worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, PromptId};

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The human (or the controller, in autonomous mode).
    User,
    /// The coding assistant.
    Assistant,
}

impl MessageRole {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// A tool invocation paired with its (possibly later-arriving) result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name as reported by the worker (`Read`, `Edit`, `Bash`, ...).
    pub name: String,
    /// Serialized tool input.
    pub input: serde_json::Value,
    /// Serialized tool result; absent until the result turn arrives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// A persisted conversation turn.
///
/// A streaming message is a mutable placeholder: at most one exists per
/// agent, and it is finalized in place (streaming flag cleared, content
/// updated, `source_uuid` stamped) when its finalized form arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Storage row id.
    pub id: i64,
    /// Owning agent.
    pub agent_id: AgentId,
    /// Turn author.
    pub role: MessageRole,
    /// Turn text.
    pub content: String,
    /// Model that produced an assistant turn, if known.
    pub model: Option<String>,
    /// Worker-reported turn timestamp.
    pub timestamp: DateTime<Utc>,
    /// Prompt that produced this turn; absent for pre-task greetings.
    pub task_id: Option<PromptId>,
    /// Tool-use / tool-result pairs carried by the turn.
    pub tools: Vec<ToolCall>,
    /// Whether this row is the mutable streaming placeholder.
    pub is_streaming: bool,
    /// Stable worker-provided id; absent while streaming.
    pub source_uuid: Option<String>,
}

impl StoredMessage {
    /// Whether two tool lists differ in their JSON representation.
    ///
    /// Used by ingestion to keep the `-1` overlap idempotent: a re-processed
    /// tail message only writes when a late tool-result actually changed it.
    pub fn tools_differ(stored: &[ToolCall], incoming: &[ToolCall]) -> bool {
        serde_json::to_value(stored).ok() != serde_json::to_value(incoming).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tools_differ_detects_late_result() {
        let without = vec![ToolCall {
            name: "Bash".into(),
            input: json!({"command": "ls"}),
            result: None,
        }];
        let with = vec![ToolCall {
            name: "Bash".into(),
            input: json!({"command": "ls"}),
            result: Some(json!({"stdout": "Cargo.toml"})),
        }];
        assert!(StoredMessage::tools_differ(&without, &with));
        assert!(!StoredMessage::tools_differ(&with, &with.clone()));
    }
}
