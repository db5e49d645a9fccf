//! State-logic tick: the RUNNING/IDLE oscillation, the prompt pump, the
//! checkpoint gates, autonomous mode, and failure detection.

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use ariana_automations::TriggerEvent;
use ariana_bus::AgentEvent;
use ariana_types::wire::PromptRequest;
use ariana_types::{
    Agent, AgentState, ContextEventKind, ModelKind, Prompt, PromptStatus, PullRequestState,
    TriggerType,
};
use ariana_worker_client::{WorkerTarget, GIT_TIMEOUT, STATE_TIMEOUT};

use crate::context::crossed_threshold;
use crate::controller::AgentController;

/// Prompt injected after each task while slop mode is active.
const SLOP_MODE_PROMPT: &str = "Look at the current state of the project and pick the most \
     valuable improvement you can ship end to end. Do it, commit, and summarize what changed.";

/// Prompt injected after each task while ralph mode is active (memory is
/// cleared first).
const RALPH_MODE_PROMPT: &str = "Read the repository from scratch, find the most important \
     unfinished work, and complete it. Commit when done.";

/// What a checkpoint attempt concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckpointOutcome {
    /// Nothing to commit, or commit (and push, when applicable) completed.
    Settled,
    /// A blocking automation is in flight; a gate flag was set and the
    /// agent must stay `RUNNING` until the worker reports it finished.
    Blocked,
}

impl AgentController {
    /// Advance one agent's state machine by a single tick.
    ///
    /// `last_known_msg_count` is the poller's finalized-message count for
    /// the agent; ghost detection keys off it.
    #[instrument(skip(self, agent), fields(agent_id = %agent.id, state = ?agent.state))]
    pub async fn step_state(&self, agent: &Agent, last_known_msg_count: usize) -> Result<()> {
        if !agent.is_pollable() {
            return Ok(());
        }
        let target = self.worker_target(agent)?;

        let state = match self.worker.claude_state(&target, STATE_TIMEOUT).await {
            Ok(state) => {
                self.consecutive_failures.remove(&agent.id);
                state
            }
            Err(err) if err.is_transient() => {
                return self.note_transient_failure(agent, &err.to_string()).await;
            }
            Err(err) => {
                debug!(agent = %agent.id, error = %err, "non-transient state poll failure");
                return Ok(());
            }
        };

        if let Some(usage) = state.context_usage {
            self.track_context_usage(agent, usage.remaining_percent).await?;
        }

        match agent.state {
            AgentState::Ready => {
                if state.is_ready && !state.has_blocking_automation {
                    self.fire_agent_ready(agent, &target).await?;
                    self.transition(agent.id, AgentState::Idle, None)
                        .await?;
                }
            }
            AgentState::Idle => {
                if !state.is_ready {
                    // The worker reports busy (e.g. a prompt sent from a
                    // previous process); follow it.
                    self.transition(agent.id, AgentState::Running, None)
                        .await?;
                } else if !state.has_blocking_automation {
                    if let Some(prompt) = self.storage.prompts().head_queued(agent.id).await? {
                        self.pump_prompt(agent, &target, prompt).await?;
                    }
                }
            }
            AgentState::Running => {
                if state.is_ready && !state.has_blocking_automation {
                    self.unproductive_since.remove(&agent.id);
                    match self.checkpoint(agent, &target).await? {
                        CheckpointOutcome::Blocked => {
                            debug!(agent = %agent.id, "checkpoint gated on blocking automation");
                        }
                        CheckpointOutcome::Settled => {
                            self.storage.prompts().finish_running(agent.id).await?;
                            self.settle_after_task(agent, &target).await?;
                        }
                    }
                } else if !state.is_ready {
                    self.detect_ghost(agent, last_known_msg_count).await?;
                }
                // Blocking automation pending: stay RUNNING.
            }
            _ => {}
        }
        Ok(())
    }

    //─────────────────────────────
    //  Prompt pump
    //─────────────────────────────

    /// Dispatch the head of the queue to an idle worker.
    ///
    /// The prompt is marked `running` *before* the send so a concurrent
    /// tick cannot pick it up again.
    #[instrument(skip(self, agent, target, prompt), fields(agent_id = %agent.id, prompt_id = %prompt.id))]
    pub(crate) async fn pump_prompt(
        &self,
        agent: &Agent,
        target: &WorkerTarget,
        prompt: Prompt,
    ) -> Result<()> {
        if let Err(err) = self
            .credentials
            .refresh_on_worker(agent.user_id, agent.id, target)
            .await
        {
            warn!(agent = %agent.id, error = %err, "credential refresh failed, retrying next tick");
            return Ok(());
        }
        self.last_credential_refresh.insert(agent.id, Instant::now());

        self.storage.prompts().set_status(prompt.id, PromptStatus::Running).await?;

        if agent.current_task_id.is_some() {
            // A task boundary without a prior checkpoint (e.g. interrupt):
            // synthesize one before starting the new task.
            if self.checkpoint(agent, target).await? == CheckpointOutcome::Blocked {
                self.storage.prompts().set_status(prompt.id, PromptStatus::Queued).await?;
                return Ok(());
            }
        }

        self.storage.agents().set_current_task(agent.id, Some(prompt.id)).await?;

        let request = PromptRequest {
            prompt: prompt.prompt.clone(),
            model: prompt.model,
            task_id: prompt.id.to_string(),
        };
        if let Err(err) = self.worker.prompt(target, &request, STATE_TIMEOUT).await {
            warn!(agent = %agent.id, error = %err, "prompt dispatch failed");
            self.storage.prompts().set_status(prompt.id, PromptStatus::Failed).await?;
            self.storage.agents().set_current_task(agent.id, None).await?;
            return Ok(());
        }

        self.transition(agent.id, AgentState::Running, None)
            .await?;
        info!(agent = %agent.id, prompt = %prompt.id, "prompt dispatched");

        self.spawn_background_improvements(agent, &prompt).await?;
        Ok(())
    }

    /// Best-effort background work after a dispatch: task summary always,
    /// branch rename only for the very first prompt. Failures never affect
    /// state transitions.
    async fn spawn_background_improvements(&self, agent: &Agent, prompt: &Prompt) -> Result<()> {
        let first_prompt = self.storage.prompts().count_for_agent(agent.id).await? == 1;
        let worker = self.worker.clone();
        let storage = self.storage.clone();
        let target = self.worker_target(agent)?;
        let agent_id = agent.id;
        let text = prompt.prompt.clone();

        tokio::spawn(async move {
            match worker.generate_task_summary(&target, &text, STATE_TIMEOUT).await {
                Ok(summary) => {
                    if let Err(err) = storage.agents().set_task_summary(agent_id, &summary.summary).await
                    {
                        debug!(agent = %agent_id, error = %err, "storing task summary failed");
                    }
                }
                Err(err) => debug!(agent = %agent_id, error = %err, "task summary failed"),
            }
            if first_prompt {
                match worker.rename_branch_from_prompt(&target, &text, GIT_TIMEOUT).await {
                    Ok(renamed) => {
                        if let Err(err) =
                            storage.agents().set_branch_name(agent_id, &renamed.branch_name).await
                        {
                            debug!(agent = %agent_id, error = %err, "storing branch name failed");
                        }
                    }
                    Err(err) => debug!(agent = %agent_id, error = %err, "branch rename failed"),
                }
            }
        });
        Ok(())
    }

    //─────────────────────────────
    //  Checkpoint
    //─────────────────────────────

    /// Commit (and push, when a PR is open) at a task boundary, gating on
    /// blocking automations.
    pub(crate) async fn checkpoint(
        &self,
        agent: &Agent,
        target: &WorkerTarget,
    ) -> Result<CheckpointOutcome> {
        let status = self
            .worker
            .git_status(target, STATE_TIMEOUT)
            .await
            .context("checkpoint git-status")?;
        if !status.has_uncommitted_changes {
            return Ok(CheckpointOutcome::Settled);
        }

        if !agent.pending_commit_triggered {
            let outcome = self
                .automations
                .fire(agent, target, &TriggerEvent::lifecycle(TriggerType::OnBeforeCommit))
                .await?;
            if outcome.has_blocking() {
                self.storage.agents().set_pending_commit(agent.id, true).await?;
                return Ok(CheckpointOutcome::Blocked);
            }
        }
        self.storage.agents().set_pending_commit(agent.id, false).await?;

        let message = self.checkpoint_message(agent).await?;
        let committed = self
            .worker
            .git_commit_and_return(target, &message, GIT_TIMEOUT)
            .await
            .context("checkpoint commit")?;
        if let Some(sha) = committed.sha {
            let now = Utc::now();
            self.storage.agents().set_last_commit(agent.id, &sha, None, now).await?;
            info!(agent = %agent.id, sha = %sha, "checkpoint committed");
        }

        self.automations
            .fire(agent, target, &TriggerEvent::lifecycle(TriggerType::OnAfterCommit))
            .await?;

        let pr_open =
            agent.pr_number.is_some() && agent.pr_state == Some(PullRequestState::Open);
        if pr_open {
            if !agent.pending_push_pr_triggered {
                let outcome = self
                    .automations
                    .fire(agent, target, &TriggerEvent::lifecycle(TriggerType::OnBeforePushPr))
                    .await?;
                if outcome.has_blocking() {
                    self.storage.agents().set_pending_push_pr(agent.id, true).await?;
                    return Ok(CheckpointOutcome::Blocked);
                }
            }
            self.storage.agents().set_pending_push_pr(agent.id, false).await?;

            self.worker.git_push(target, GIT_TIMEOUT).await.context("checkpoint push")?;
            self.automations
                .fire(agent, target, &TriggerEvent::lifecycle(TriggerType::OnAfterPushPr))
                .await?;
        }

        Ok(CheckpointOutcome::Settled)
    }

    /// Derive the commit message from the prompt that produced the work.
    async fn checkpoint_message(&self, agent: &Agent) -> Result<String> {
        let text = match agent.current_task_id {
            Some(task_id) => self
                .storage
                .prompts()
                .get(task_id)
                .await?
                .map(|p| p.prompt),
            None => None,
        };
        Ok(commit_message_from_prompt(text.as_deref().unwrap_or("Agent checkpoint")))
    }

    //─────────────────────────────
    //  Autonomous mode
    //─────────────────────────────

    /// After a settled checkpoint: either inject the next autonomous prompt
    /// (staying `RUNNING`), or go `IDLE`.
    async fn settle_after_task(&self, agent: &Agent, target: &WorkerTarget) -> Result<()> {
        let now = Utc::now();
        if agent.in_slop_mode(now) {
            let mut text = SLOP_MODE_PROMPT.to_string();
            if let Some(custom) = &agent.slop_mode_custom_prompt {
                text.push_str("\n\n");
                text.push_str(custom);
            }
            self.inject_autonomous_prompt(agent, target, text, false).await?;
            return Ok(());
        }
        if agent.ralph_mode {
            self.inject_autonomous_prompt(agent, target, RALPH_MODE_PROMPT.to_string(), true)
                .await?;
            return Ok(());
        }
        self.transition(agent.id, AgentState::Idle, None)
            .await?;
        Ok(())
    }

    /// Insert a `running` prompt and send it without visiting `IDLE`. The
    /// previously used model is reused.
    async fn inject_autonomous_prompt(
        &self,
        agent: &Agent,
        target: &WorkerTarget,
        text: String,
        clear_memory_first: bool,
    ) -> Result<()> {
        if clear_memory_first {
            self.worker.reset(target, STATE_TIMEOUT).await.context("autonomous reset")?;
            self.context_thresholds.remove(&agent.id);
            self.automations
                .fire(agent, target, &TriggerEvent::lifecycle(TriggerType::OnAfterReset))
                .await?;
        }

        let model = self
            .storage
            .prompts()
            .last_used_model(agent.id)
            .await?
            .unwrap_or(ModelKind::Sonnet);
        let mut prompt = Prompt::new(agent.id, text, model).map_err(|e| anyhow!(e))?;
        prompt.status = PromptStatus::Running;
        self.storage.prompts().queue(&prompt).await?;
        self.storage.agents().set_current_task(agent.id, Some(prompt.id)).await?;

        let request = PromptRequest {
            prompt: prompt.prompt.clone(),
            model,
            task_id: prompt.id.to_string(),
        };
        if let Err(err) = self.worker.prompt(target, &request, STATE_TIMEOUT).await {
            warn!(agent = %agent.id, error = %err, "autonomous dispatch failed, going idle");
            self.storage.prompts().set_status(prompt.id, PromptStatus::Failed).await?;
            self.storage.agents().set_current_task(agent.id, None).await?;
            self.transition(agent.id, AgentState::Idle, None)
                .await?;
            return Ok(());
        }
        info!(agent = %agent.id, prompt = %prompt.id, "autonomous prompt injected");
        // State stays RUNNING; no IDLE visit.
        Ok(())
    }

    //─────────────────────────────
    //  Failure detection
    //─────────────────────────────

    /// Count a transient RPC failure; at the threshold the machine is
    /// declared dead.
    async fn note_transient_failure(&self, agent: &Agent, detail: &str) -> Result<()> {
        let failures = {
            let mut entry = self.consecutive_failures.entry(agent.id).or_insert(0);
            *entry += 1;
            *entry
        };
        debug!(agent = %agent.id, failures, "transient worker failure");
        if failures >= self.config.failure_threshold {
            self.fail_agent(
                agent.id,
                &format!("machine unreachable after {failures} consecutive checks: {detail}"),
            )
            .await?;
        }
        Ok(())
    }

    /// RUNNING + worker busy + zero messages ever: after the ghost timeout
    /// the agent is failed.
    async fn detect_ghost(&self, agent: &Agent, last_known_msg_count: usize) -> Result<()> {
        if last_known_msg_count > 0 {
            self.unproductive_since.remove(&agent.id);
            return Ok(());
        }
        let since = *self.unproductive_since.entry(agent.id).or_insert_with(Instant::now);
        if since.elapsed() >= self.config.ghost_timeout {
            self.fail_agent(agent.id, "ghost agent: running with no output").await?;
        }
        Ok(())
    }

    //─────────────────────────────
    //  Context thresholds
    //─────────────────────────────

    /// Record a `context_warning` when remaining context crosses a 10%
    /// bucket downward. One event per crossing.
    pub(crate) async fn track_context_usage(&self, agent: &Agent, remaining: f64) -> Result<()> {
        let last = self
            .context_thresholds
            .get(&agent.id)
            .map(|e| *e)
            .unwrap_or(self.config.initial_context_threshold);
        if let Some(new_threshold) = crossed_threshold(last, remaining) {
            self.context_thresholds.insert(agent.id, new_threshold);
            self.storage
                .context_events()
                .insert(agent.id, ContextEventKind::ContextWarning, Some(remaining))
                .await?;
            let _ = self.bus.publish(&AgentEvent::ContextWarning {
                agent_id: agent.id,
                remaining_percent: remaining,
            });
            info!(agent = %agent.id, remaining, threshold = new_threshold, "context warning");
        }
        Ok(())
    }
}

/// First line of the prompt, truncated to a git-friendly subject length.
pub(crate) fn commit_message_from_prompt(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return "Agent checkpoint".to_string();
    }
    const MAX: usize = 72;
    if first_line.chars().count() <= MAX {
        first_line.to_string()
    } else {
        let mut cut: String = first_line.chars().take(MAX - 1).collect();
        cut.push('…');
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_takes_first_line() {
        assert_eq!(
            commit_message_from_prompt("write a README\nwith details"),
            "write a README"
        );
    }

    #[test]
    fn commit_message_truncates_long_prompts() {
        let long = "x".repeat(200);
        let message = commit_message_from_prompt(&long);
        assert_eq!(message.chars().count(), 72);
        assert!(message.ends_with('…'));
    }

    #[test]
    fn commit_message_falls_back_on_empty() {
        assert_eq!(commit_message_from_prompt("   \n"), "Agent checkpoint");
    }
}
