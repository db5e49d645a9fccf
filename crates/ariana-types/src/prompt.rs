//! Queued prompts - the unit of work an agent executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, PromptId, MAX_PROMPT_LEN};

/// Model tier a prompt is executed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Highest capability tier.
    Opus,
    /// Default tier.
    Sonnet,
    /// Fastest tier.
    Haiku,
}

impl ModelKind {
    /// Stable storage / wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Opus => "opus",
            ModelKind::Sonnet => "sonnet",
            ModelKind::Haiku => "haiku",
        }
    }
}

impl std::str::FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opus" => Ok(ModelKind::Opus),
            "sonnet" => Ok(ModelKind::Sonnet),
            "haiku" => Ok(ModelKind::Haiku),
            other => Err(format!("unknown model: {other}")),
        }
    }
}

/// Execution status of a prompt.
///
/// At most one prompt per agent is `Running` at any time; the prompt pump
/// enforces this by marking the head `Running` before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStatus {
    /// Waiting in the FIFO queue.
    Queued,
    /// Dispatched to the worker.
    Running,
    /// Completed (including user interrupts).
    Finished,
    /// Dispatch failed or the worker died while executing.
    Failed,
}

impl PromptStatus {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            PromptStatus::Queued => "queued",
            PromptStatus::Running => "running",
            PromptStatus::Finished => "finished",
            PromptStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for PromptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(PromptStatus::Queued),
            "running" => Ok(PromptStatus::Running),
            "finished" => Ok(PromptStatus::Finished),
            "failed" => Ok(PromptStatus::Failed),
            other => Err(format!("unknown prompt status: {other}")),
        }
    }
}

/// A queued unit of work for an agent. Ordering is FIFO by `created_at`
/// within an agent; the prompt's id doubles as the task id of every message
/// and commit it produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    /// Unique identifier (and task id once running).
    pub id: PromptId,
    /// Owning agent.
    pub agent_id: AgentId,
    /// Natural-language instruction text.
    pub prompt: String,
    /// Model tier to execute with.
    pub model: ModelKind,
    /// Queue status.
    pub status: PromptStatus,
    /// Enqueue time; the FIFO key.
    pub created_at: DateTime<Utc>,
}

impl Prompt {
    /// Create a queued prompt, validating the text length.
    pub fn new(agent_id: AgentId, prompt: String, model: ModelKind) -> Result<Self, String> {
        if prompt.trim().is_empty() {
            return Err("prompt text cannot be empty".to_string());
        }
        if prompt.len() > MAX_PROMPT_LEN {
            return Err(format!("prompt too long: {} > {}", prompt.len(), MAX_PROMPT_LEN));
        }
        Ok(Self {
            id: PromptId::new(),
            agent_id,
            prompt,
            model,
            status: PromptStatus::Queued,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_prompt_is_queued() {
        let p = Prompt::new(AgentId::new(), "write a README".into(), ModelKind::Sonnet).unwrap();
        assert_eq!(p.status, PromptStatus::Queued);
    }

    #[test]
    fn empty_prompt_rejected() {
        assert!(Prompt::new(AgentId::new(), "   ".into(), ModelKind::Haiku).is_err());
    }
}
