//! Agent entity and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, MachineId, ProjectId, PromptId, UserId};

/// Lifecycle state of an agent.
///
/// The controller is the only writer of this field; every write must be a
/// legal transition per [`AgentState::can_transition_to`]. `ERROR` and
/// `ARCHIVED` are resumable terminals (they re-enter `PROVISIONING`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    /// A machine is being acquired for the agent.
    Provisioning,
    /// A healthy machine is attached; source acquisition has not started.
    Provisioned,
    /// The worker is cloning or restoring the repository.
    Cloning,
    /// The worker finished setup and has not yet been observed idle.
    Ready,
    /// The worker is reachable and waiting for work.
    Idle,
    /// The worker is executing a task.
    Running,
    /// The agent failed; resumable via `resume_error`.
    Error,
    /// The agent is being archived.
    Archiving,
    /// The agent is archived; resumable via `resume_archived`.
    Archived,
}

/// Error returned when a state write would violate the transition table.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("illegal agent state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    /// State the agent was in.
    pub from: AgentState,
    /// State the write attempted to reach.
    pub to: AgentState,
}

impl AgentState {
    /// Whether the controller may move an agent from `self` to `to`.
    ///
    /// Staying in place is always legal (ticks are idempotent). Any state
    /// may fall to `Error`; `Error` and `Archived` may only re-enter
    /// `Provisioning`.
    pub fn can_transition_to(self, to: AgentState) -> bool {
        use AgentState::*;
        if self == to {
            return true;
        }
        match (self, to) {
            (_, Error) => !matches!(self, Archived),
            (Provisioning, Provisioned) => true,
            (Provisioned, Cloning) => true,
            (Cloning, Ready) => true,
            (Ready, Idle) => true,
            (Idle, Running) | (Running, Idle) => true,
            (Idle, Archiving) | (Error, Archiving) => true,
            (Archiving, Archived) => true,
            (Error, Provisioning) | (Archived, Provisioning) => true,
            _ => false,
        }
    }

    /// Check a transition, producing a typed error for the storage layer.
    pub fn check_transition(self, to: AgentState) -> Result<(), InvalidTransition> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    /// States in which the poller and state-logic tick consider the agent.
    pub fn is_pollable(self) -> bool {
        matches!(self, AgentState::Ready | AgentState::Idle | AgentState::Running)
    }

    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Provisioning => "PROVISIONING",
            AgentState::Provisioned => "PROVISIONED",
            AgentState::Cloning => "CLONING",
            AgentState::Ready => "READY",
            AgentState::Idle => "IDLE",
            AgentState::Running => "RUNNING",
            AgentState::Error => "ERROR",
            AgentState::Archiving => "ARCHIVING",
            AgentState::Archived => "ARCHIVED",
        }
    }
}

impl std::str::FromStr for AgentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROVISIONING" => Ok(AgentState::Provisioning),
            "PROVISIONED" => Ok(AgentState::Provisioned),
            "CLONING" => Ok(AgentState::Cloning),
            "READY" => Ok(AgentState::Ready),
            "IDLE" => Ok(AgentState::Idle),
            "RUNNING" => Ok(AgentState::Running),
            "ERROR" => Ok(AgentState::Error),
            "ARCHIVING" => Ok(AgentState::Archiving),
            "ARCHIVED" => Ok(AgentState::Archived),
            other => Err(format!("unknown agent state: {other}")),
        }
    }
}

/// Where the agent's machine comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    /// Pre-warmed machine allocated through the reservation queue.
    Pool,
    /// User-owned machine registered manually.
    Custom,
}

impl MachineType {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            MachineType::Pool => "pool",
            MachineType::Custom => "custom",
        }
    }
}

impl std::str::FromStr for MachineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pool" => Ok(MachineType::Pool),
            "custom" => Ok(MachineType::Custom),
            other => Err(format!("unknown machine type: {other}")),
        }
    }
}

/// State of the pull request tracked for an agent's branch, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestState {
    /// PR is open.
    Open,
    /// PR was closed without merging.
    Closed,
    /// PR was merged.
    Merged,
}

impl PullRequestState {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            PullRequestState::Open => "open",
            PullRequestState::Closed => "closed",
            PullRequestState::Merged => "merged",
        }
    }
}

impl std::str::FromStr for PullRequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PullRequestState::Open),
            "closed" => Ok(PullRequestState::Closed),
            "merged" => Ok(PullRequestState::Merged),
            other => Err(format!("unknown pull request state: {other}")),
        }
    }
}

/// The unit of work this control plane manages: one containerized session on
/// a remote worker machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier.
    pub id: AgentId,
    /// Owning user.
    pub user_id: UserId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Human-visible name.
    pub name: String,
    /// Git branch the agent works on.
    pub branch_name: String,
    /// Repository the agent clones, as `owner/name` on the git host.
    pub repo_full_name: String,
    /// Generated one-line summary of the current task, if any.
    pub task_summary: Option<String>,

    /// Machine currently attached, if any.
    pub machine_id: Option<MachineId>,
    /// Pool or custom placement.
    pub machine_type: MachineType,
    /// Hostname or IP of the worker.
    pub machine_address: Option<String>,
    /// Shared secret authenticating worker RPC.
    pub machine_shared_key: Option<String>,
    /// Token granting access to the worker's service previews.
    pub service_preview_token: Option<String>,
    /// Execution-environment preset chosen at creation, if any.
    pub environment_id: Option<String>,

    /// Lifecycle state; written only by the controller.
    pub state: AgentState,
    /// Soft-delete flag, orthogonal to state. Trashed agents are skipped.
    pub is_trashed: bool,
    /// When provisioning completed.
    pub provisioned_at: Option<DateTime<Utc>>,
    /// Remaining budget of lifetime slices (never negative).
    pub lifetime_units: i64,

    /// Prompt currently executing, if any.
    pub current_task_id: Option<PromptId>,
    /// A blocking `on_before_commit` hook is in flight.
    pub pending_commit_triggered: bool,
    /// A blocking `on_before_push_pr` hook is in flight.
    pub pending_push_pr_triggered: bool,

    /// SHA of the newest commit observed on the worker.
    pub last_commit_sha: Option<String>,
    /// Web URL of that commit, when pushed.
    pub last_commit_url: Option<String>,
    /// Author timestamp of that commit.
    pub last_commit_at: Option<DateTime<Utc>>,
    /// Cutoff SHA for incremental git-history fetches.
    pub git_history_last_pushed_commit_sha: Option<String>,
    /// SHA the agent branched from.
    pub start_commit_sha: Option<String>,
    /// Pull request number for the agent branch, if one exists.
    pub pr_number: Option<i64>,
    /// Last synced PR state.
    pub pr_state: Option<PullRequestState>,
    /// Base branch of the PR.
    pub pr_base_branch: Option<String>,
    /// When PR state was last synced.
    pub pr_last_synced_at: Option<DateTime<Utc>>,

    /// While set and in the future, the controller injects follow-up prompts
    /// instead of going idle.
    pub slop_mode_until: Option<DateTime<Utc>>,
    /// Optional suffix appended to the injected slop prompt.
    pub slop_mode_custom_prompt: Option<String>,
    /// Ralph mode: clear conversation memory, then inject the fixed prompt.
    pub ralph_mode: bool,

    /// Human-readable failure context when state is `ERROR`.
    pub error_message: Option<String>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Build a freshly registered agent in `PROVISIONING` with no machine
    /// attached. Everything else starts empty.
    pub fn provisioning(
        user_id: UserId,
        project_id: ProjectId,
        name: String,
        branch_name: String,
        repo_full_name: String,
        machine_type: MachineType,
        lifetime_units: i64,
    ) -> Self {
        Self {
            id: AgentId::new(),
            user_id,
            project_id,
            name,
            branch_name,
            repo_full_name,
            task_summary: None,
            machine_id: None,
            machine_type,
            machine_address: None,
            machine_shared_key: None,
            service_preview_token: None,
            environment_id: None,
            state: AgentState::Provisioning,
            is_trashed: false,
            provisioned_at: None,
            lifetime_units,
            current_task_id: None,
            pending_commit_triggered: false,
            pending_push_pr_triggered: false,
            last_commit_sha: None,
            last_commit_url: None,
            last_commit_at: None,
            git_history_last_pushed_commit_sha: None,
            start_commit_sha: None,
            pr_number: None,
            pr_state: None,
            pr_base_branch: None,
            pr_last_synced_at: None,
            slop_mode_until: None,
            slop_mode_custom_prompt: None,
            ralph_mode: false,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the agent is in slop mode at `now`.
    pub fn in_slop_mode(&self, now: DateTime<Utc>) -> bool {
        self.slop_mode_until.map(|until| until > now).unwrap_or(false)
    }

    /// Whether the poller and state tick should consider this agent.
    pub fn is_pollable(&self) -> bool {
        !self.is_trashed && self.state.is_pollable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_walk_is_legal() {
        use AgentState::*;
        let walk = [
            Provisioning,
            Provisioned,
            Cloning,
            Ready,
            Idle,
            Running,
            Idle,
            Running,
            Idle,
        ];
        for pair in walk.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn error_is_reachable_from_live_states_only() {
        use AgentState::*;
        for from in [Provisioning, Provisioned, Cloning, Ready, Idle, Running] {
            assert!(from.can_transition_to(Error));
        }
        assert!(!Archived.can_transition_to(Error));
    }

    #[test]
    fn resume_reenters_provisioning() {
        assert!(AgentState::Error.can_transition_to(AgentState::Provisioning));
        assert!(AgentState::Archived.can_transition_to(AgentState::Provisioning));
        assert!(!AgentState::Idle.can_transition_to(AgentState::Provisioning));
    }

    #[test]
    fn no_state_skipping() {
        use AgentState::*;
        assert!(!Provisioning.can_transition_to(Ready));
        assert!(!Provisioned.can_transition_to(Idle));
        assert!(!Ready.can_transition_to(Running));
        assert!(!Running.can_transition_to(Archived));
    }

    #[test]
    fn state_round_trips_through_storage_repr() {
        use AgentState::*;
        for state in [
            Provisioning,
            Provisioned,
            Cloning,
            Ready,
            Idle,
            Running,
            Error,
            Archiving,
            Archived,
        ] {
            assert_eq!(state.as_str().parse::<AgentState>().unwrap(), state);
        }
    }
}
