//! Wire types exchanged with the worker daemon.
//!
//! The worker owns the wire format; these mirror its JSON payloads
//! (camelCase field names). They are deliberately separate from the
//! persisted entities so that worker payload changes never leak into
//! storage schemas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AutomationId, ModelKind, ScriptLanguage};

/// Generic acknowledgement returned by push endpoints.
///
/// `success = false` is a *worker semantic failure*: the daemon is up and
/// answered, but refused or failed the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAck {
    /// Whether the worker performed the operation.
    pub success: bool,
    /// Failure detail when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Context-window usage reported by `/claude-state`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    /// Percentage of the window consumed.
    pub used_percent: f64,
    /// Percentage of the window remaining.
    pub remaining_percent: f64,
    /// Absolute token count consumed.
    pub total_tokens: u64,
}

/// Snapshot returned by `/claude-state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    /// The assistant is idle and can accept a prompt.
    pub is_ready: bool,
    /// A blocking automation is still executing.
    pub has_blocking_automation: bool,
    /// Ids of the blocking automations currently executing.
    #[serde(default)]
    pub blocking_automation_ids: Vec<AutomationId>,
    /// Context-window usage, when the worker can measure it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_usage: Option<ContextUsage>,
}

/// A tool-use / tool-result pair inside a conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerToolCall {
    /// Tool name.
    pub name: String,
    /// Tool input payload.
    pub input: serde_json::Value,
    /// Tool result payload; absent until the result arrives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// One conversation turn returned by `/conversations`.
///
/// The list is fully ordered; a trailing entry with `is_streaming = true`
/// is the in-flight assistant turn and mutates between polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMessage {
    /// Stable worker-side id; absent while the turn is still streaming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uuid: Option<String>,
    /// `user` or `assistant`.
    pub role: String,
    /// Turn text.
    #[serde(default)]
    pub content: String,
    /// Model that produced an assistant turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Worker-side turn timestamp.
    pub timestamp: DateTime<Utc>,
    /// Tool calls carried by the turn.
    #[serde(default)]
    pub tools: Vec<WorkerToolCall>,
    /// Whether this is the mutable trailing entry.
    #[serde(default)]
    pub is_streaming: bool,
}

/// Payload of `/conversations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsResponse {
    /// Ordered turns, oldest first.
    pub messages: Vec<WorkerMessage>,
}

/// One commit returned by `/git-history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCommit {
    /// Full SHA.
    pub sha: String,
    /// Commit message.
    pub message: String,
    /// Files touched.
    pub files_changed: i64,
    /// Lines added.
    pub additions: i64,
    /// Lines deleted.
    pub deletions: i64,
    /// Whether the commit exists on the remote.
    pub pushed: bool,
    /// Patch text for unpushed commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    /// Author timestamp.
    pub authored_at: DateTime<Utc>,
}

/// Payload of `/git-history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHistoryReport {
    /// Commits newer than the requested cutoff (or all, when full).
    pub commits: Vec<WorkerCommit>,
    /// Whether the worker returned the full history rather than a slice
    /// after the cutoff. Deletion detection is only sound on full fetches.
    pub full_history: bool,
    /// Patch of uncommitted changes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncommitted_patch: Option<String>,
    /// Total diff against the start commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_diff: Option<String>,
    /// Branch currently checked out on the worker.
    pub branch_name: String,
}

/// Payload of `/git-status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatusReport {
    /// Whether the working tree has uncommitted changes.
    pub has_uncommitted_changes: bool,
}

/// Payload of `/git-commit-and-return`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResult {
    /// SHA of the created commit, absent when there was nothing to commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
}

/// One automation execution update returned by `/poll-automation-events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAutomationEvent {
    /// Automation that ran.
    pub automation_id: AutomationId,
    /// `running`, `finished`, `failed`, or `killed`.
    pub status: String,
    /// Output captured so far.
    #[serde(default)]
    pub output: String,
    /// Exit code, once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Execution start.
    pub started_at: DateTime<Utc>,
    /// Execution end, once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Side effect requested by an automation script, returned by
/// `/poll-automation-actions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationAction {
    /// Interrupt the agent.
    StopAgent,
    /// Enqueue a prompt on the agent.
    QueuePrompt {
        /// Prompt text to enqueue.
        prompt: String,
        /// Model override; the agent's last model when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<ModelKind>,
    },
}

/// Context-window event returned by `/poll-context-events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerContextEvent {
    /// `compaction` or `reset`.
    pub kind: String,
    /// Event time.
    pub timestamp: DateTime<Utc>,
}

/// Source-acquisition instruction for `/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum StartSetup {
    /// Clone a private repository with an installation token.
    CloneWithToken {
        /// Repository clone URL.
        repo_url: String,
        /// Git-host access token.
        token: String,
        /// Base branch to check out.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_branch: Option<String>,
    },
    /// Clone a public repository.
    ClonePublic {
        /// Repository clone URL.
        repo_url: String,
        /// Base branch to check out.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_branch: Option<String>,
    },
    /// Rebuild history from a patch bundle (archive resume).
    RestoreBundle {
        /// Patch bundle produced by a previous session.
        patch: String,
        /// Commit the bundle applies onto.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_commit_sha: Option<String>,
    },
}

/// Prompt dispatch payload for `/prompt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    /// Prompt text.
    pub prompt: String,
    /// Model tier.
    pub model: ModelKind,
    /// Task id the worker should stamp on resulting turns.
    pub task_id: String,
}

/// One automation shipped to `/execute-automations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationDispatch {
    /// Automation id, echoed back in the executed subset.
    pub id: AutomationId,
    /// Human-visible name for worker-side logs.
    pub name: String,
    /// Script language.
    pub script_language: ScriptLanguage,
    /// Script body.
    pub script_content: String,
    /// Whether the worker should report it as blocking state.
    pub blocking: bool,
    /// Whether output is fed back into the conversation.
    pub feed_output: bool,
}

/// Response of `/execute-automations`: the subset actually started.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedAutomations {
    /// Ids the worker accepted and started.
    pub executed_ids: Vec<AutomationId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_state_tolerates_missing_optionals() {
        let ws: WorkerState =
            serde_json::from_str(r#"{"isReady":true,"hasBlockingAutomation":false}"#).unwrap();
        assert!(ws.is_ready);
        assert!(ws.blocking_automation_ids.is_empty());
        assert!(ws.context_usage.is_none());
    }

    #[test]
    fn automation_action_tag_round_trip() {
        let action: AutomationAction = serde_json::from_str(
            r#"{"type":"queue_prompt","prompt":"run the tests","model":"haiku"}"#,
        )
        .unwrap();
        match action {
            AutomationAction::QueuePrompt { prompt, model } => {
                assert_eq!(prompt, "run the tests");
                assert_eq!(model, Some(ModelKind::Haiku));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn start_setup_is_mode_tagged() {
        let json = serde_json::to_value(StartSetup::ClonePublic {
            repo_url: "https://github.com/a/b.git".into(),
            base_branch: Some("main".into()),
        })
        .unwrap();
        assert_eq!(json["mode"], "clonePublic");
    }
}
