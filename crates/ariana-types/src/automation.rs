//! User-defined automations and the event records they produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, AutomationId, ProjectId, UserId};

/// Lifecycle hook an automation is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Fired only on explicit user request.
    #[default]
    Manual,
    /// Fired once when the agent first reports ready.
    OnAgentReady,
    /// Fired before the checkpoint commit; may block it.
    OnBeforeCommit,
    /// Fired after the checkpoint commit.
    OnAfterCommit,
    /// Fired before pushing to an open PR; may block the push.
    OnBeforePushPr,
    /// Fired after pushing to an open PR.
    OnAfterPushPr,
    /// Fired when an assistant turn read files.
    OnAfterReadFiles,
    /// Fired when an assistant turn edited files.
    OnAfterEditFiles,
    /// Fired when an assistant turn ran a shell command.
    OnAfterRunCommand,
    /// Fired after the agent's conversation memory is cleared.
    OnAfterReset,
    /// Fired when another automation finishes.
    OnAutomationFinishes,
}

impl TriggerType {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::OnAgentReady => "on_agent_ready",
            TriggerType::OnBeforeCommit => "on_before_commit",
            TriggerType::OnAfterCommit => "on_after_commit",
            TriggerType::OnBeforePushPr => "on_before_push_pr",
            TriggerType::OnAfterPushPr => "on_after_push_pr",
            TriggerType::OnAfterReadFiles => "on_after_read_files",
            TriggerType::OnAfterEditFiles => "on_after_edit_files",
            TriggerType::OnAfterRunCommand => "on_after_run_command",
            TriggerType::OnAfterReset => "on_after_reset",
            TriggerType::OnAutomationFinishes => "on_automation_finishes",
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "on_agent_ready" => Ok(TriggerType::OnAgentReady),
            "on_before_commit" => Ok(TriggerType::OnBeforeCommit),
            "on_after_commit" => Ok(TriggerType::OnAfterCommit),
            "on_before_push_pr" => Ok(TriggerType::OnBeforePushPr),
            "on_after_push_pr" => Ok(TriggerType::OnAfterPushPr),
            "on_after_read_files" => Ok(TriggerType::OnAfterReadFiles),
            "on_after_edit_files" => Ok(TriggerType::OnAfterEditFiles),
            "on_after_run_command" => Ok(TriggerType::OnAfterRunCommand),
            "on_after_reset" => Ok(TriggerType::OnAfterReset),
            "on_automation_finishes" => Ok(TriggerType::OnAutomationFinishes),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// Trigger binding of an automation: the hook plus optional filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationTrigger {
    /// Hook the automation fires on.
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// File glob filter for file-touching tool hooks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_glob: Option<String>,
    /// Command regex filter for `on_after_run_command`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_regex: Option<String>,
    /// Upstream automation filter for `on_automation_finishes`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_id: Option<AutomationId>,
}

/// Language an automation script is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    /// Shell script.
    Bash,
    /// Node script.
    Javascript,
    /// Python script.
    Python,
}

impl ScriptLanguage {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptLanguage::Bash => "bash",
            ScriptLanguage::Javascript => "javascript",
            ScriptLanguage::Python => "python",
        }
    }
}

impl std::str::FromStr for ScriptLanguage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bash" => Ok(ScriptLanguage::Bash),
            "javascript" => Ok(ScriptLanguage::Javascript),
            "python" => Ok(ScriptLanguage::Python),
            other => Err(format!("unknown script language: {other}")),
        }
    }
}

/// A user-defined script bound to a lifecycle hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    /// Unique identifier.
    pub id: AutomationId,
    /// Owning project; automations apply to every agent of the project.
    pub project_id: ProjectId,
    /// Creating user.
    pub user_id: UserId,
    /// Human-visible name.
    pub name: String,
    /// Hook binding and filters.
    pub trigger: AutomationTrigger,
    /// Script language.
    pub script_language: ScriptLanguage,
    /// Script body, executed on the worker.
    pub script_content: String,
    /// Blocking automations gate the commit/push they fire around.
    pub blocking: bool,
    /// Whether the script output is fed back into the conversation.
    pub feed_output: bool,
}

/// Status of one automation execution on the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationEventStatus {
    /// Still executing.
    Running,
    /// Exited zero.
    Finished,
    /// Exited non-zero.
    Failed,
    /// Killed by the worker or superseded by a newer run.
    Killed,
}

impl AutomationEventStatus {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            AutomationEventStatus::Running => "running",
            AutomationEventStatus::Finished => "finished",
            AutomationEventStatus::Failed => "failed",
            AutomationEventStatus::Killed => "killed",
        }
    }

    /// Whether this status ends the execution.
    pub fn is_terminal(self) -> bool {
        !matches!(self, AutomationEventStatus::Running)
    }
}

impl std::str::FromStr for AutomationEventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(AutomationEventStatus::Running),
            "finished" => Ok(AutomationEventStatus::Finished),
            "failed" => Ok(AutomationEventStatus::Failed),
            "killed" => Ok(AutomationEventStatus::Killed),
            other => Err(format!("unknown automation event status: {other}")),
        }
    }
}

/// Record of one automation execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationEvent {
    /// Storage row id.
    pub id: i64,
    /// Automation that ran.
    pub automation_id: AutomationId,
    /// Agent it ran against.
    pub agent_id: AgentId,
    /// Execution status.
    pub status: AutomationEventStatus,
    /// Captured output so far (snapshots while running, full on finish).
    pub output: String,
    /// Exit code, once terminal.
    pub exit_code: Option<i64>,
    /// Execution start.
    pub started_at: DateTime<Utc>,
    /// Execution end, once terminal.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Kind of a context-window event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextEventKind {
    /// Remaining context crossed a 10% threshold downward.
    ContextWarning,
    /// The worker compacted the conversation; thresholds reset.
    Compaction,
}

impl ContextEventKind {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ContextEventKind::ContextWarning => "context_warning",
            ContextEventKind::Compaction => "compaction",
        }
    }
}

impl std::str::FromStr for ContextEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context_warning" => Ok(ContextEventKind::ContextWarning),
            "compaction" => Ok(ContextEventKind::Compaction),
            other => Err(format!("unknown context event kind: {other}")),
        }
    }
}

/// Record of a context-window boundary crossing or compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEvent {
    /// Storage row id.
    pub id: i64,
    /// Owning agent.
    pub agent_id: AgentId,
    /// What happened.
    pub kind: ContextEventKind,
    /// Remaining context percentage at event time, when known.
    pub remaining_percent: Option<f64>,
    /// Event time.
    pub created_at: DateTime<Utc>,
}
