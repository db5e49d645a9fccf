//! Git commits observed on the worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, PromptId};

/// A git commit observed in the agent's working branch.
///
/// Commits are never deleted from storage. A commit that vanishes from the
/// worker's history (amended, rebased away) is flagged `is_deleted`, and the
/// flag never resets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    /// Full commit SHA; the stable upsert key.
    pub commit_sha: String,
    /// Owning agent.
    pub agent_id: AgentId,
    /// Branch the commit was observed on.
    pub branch_name: String,
    /// Commit message.
    pub commit_message: String,
    /// Prompt assigned by chronology: the latest prompt whose `created_at`
    /// is not after the commit's author timestamp.
    pub task_id: Option<PromptId>,
    /// Number of files changed.
    pub files_changed: i64,
    /// Lines added.
    pub additions: i64,
    /// Lines deleted.
    pub deletions: i64,
    /// Whether the commit has been pushed to the remote.
    pub pushed: bool,
    /// Patch text for unpushed commits, used to rebuild history on resume.
    pub commit_patch: Option<String>,
    /// Latched tombstone flag; see type docs.
    pub is_deleted: bool,
    /// Author timestamp; used to match a commit with its amended successor.
    pub authored_at: DateTime<Utc>,
}
