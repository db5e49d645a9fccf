//! Per-agent poll cycle: conversation ingestion, automation events and
//! actions, context events, PR sync, and fire-and-forget git history.
//!
//! Subsystems run in parallel with `allSettled` semantics: one failing
//! subsystem is logged and the cycle continues. Git history runs on its
//! own throttle and never blocks the cycle.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use ariana_automations::TriggerEvent;
use ariana_bus::AgentEvent;
use ariana_types::wire::{WorkerCommit, WorkerMessage};
use ariana_types::{
    Agent, AutomationEventStatus, Commit, ContextEventKind, MessageRole, ModelKind,
    StoredMessage, ToolCall, TriggerType,
};
use ariana_worker_client::{WorkerTarget, GIT_TIMEOUT, POLL_TIMEOUT};

use crate::controller::AgentController;

impl AgentController {
    /// Run one poll cycle for an agent.
    #[instrument(skip(self, agent), fields(agent_id = %agent.id))]
    pub async fn poll_once(self: &Arc<Self>, agent: &Agent) -> Result<()> {
        if !agent.is_pollable() {
            return Ok(());
        }
        let target = self.worker_target(agent)?;

        // Git history: own throttle, fire-and-forget so a slow git
        // operation cannot delay the cycle.
        if self.git_poll_due(agent) {
            let controller = Arc::clone(self);
            let agent = agent.clone();
            let target = target.clone();
            tokio::spawn(async move {
                if let Err(err) = controller.sync_git_history(&agent, &target).await {
                    debug!(agent = %agent.id, error = %err, "git history sync failed");
                }
            });
        }

        let started = Instant::now();
        let (conversations, automation_events, actions, context_events, pull_request) = tokio::join!(
            self.ingest_conversations(agent, &target),
            self.sync_automation_events(agent, &target),
            self.apply_automation_actions(agent, &target),
            self.ingest_context_events(agent, &target),
            self.sync_pull_request(agent),
        );
        for (subsystem, result) in [
            ("conversations", conversations),
            ("automation-events", automation_events),
            ("automation-actions", actions),
            ("context-events", context_events),
            ("pull-request", pull_request),
        ] {
            if let Err(err) = result {
                debug!(agent = %agent.id, subsystem, error = %err, "poll subsystem failed");
            }
        }
        debug!(agent = %agent.id, elapsed_ms = started.elapsed().as_millis() as u64, "poll cycle");
        Ok(())
    }

    //─────────────────────────────
    //  Conversation ingestion
    //─────────────────────────────

    /// Delta-ingest the worker's message list.
    ///
    /// Processes finalized messages from `last_count - 1` (the overlap
    /// re-checks the previous tail so tool-results arriving after the
    /// tool-use are picked up) plus the trailing streaming entry. Replaying
    /// an unchanged payload writes nothing and emits no notification.
    pub(crate) async fn ingest_conversations(
        &self,
        agent: &Agent,
        target: &WorkerTarget,
    ) -> Result<()> {
        let response = self.worker.conversations(target, POLL_TIMEOUT).await?;
        let (finalized, streaming): (Vec<WorkerMessage>, Vec<WorkerMessage>) =
            response.messages.into_iter().partition(|m| !m.is_streaming);

        let current_count = finalized.len();
        let last_count = self.last_message_count.get(&agent.id).map(|e| *e).unwrap_or(0);
        let from = last_count.saturating_sub(1).min(current_count);

        let mut added = Vec::new();
        let mut modified = Vec::new();
        for message in &finalized[from..] {
            if message.content.is_empty() && message.tools.is_empty() {
                continue;
            }
            self.process_finalized(agent, target, message, &mut added, &mut modified).await?;
        }

        if let Some(stream) = streaming.last() {
            if !stream.content.is_empty() || !stream.tools.is_empty() {
                let role = stream.role.parse().unwrap_or(MessageRole::Assistant);
                let upsert = self
                    .storage
                    .messages()
                    .upsert_streaming(
                        agent.id,
                        role,
                        &stream.content,
                        stream.model.as_deref(),
                        stream.timestamp,
                        agent.current_task_id,
                    )
                    .await?;
                if upsert.added {
                    added.push(upsert.id);
                } else if upsert.modified {
                    modified.push(upsert.id);
                }
            }
        }

        self.last_message_count.insert(agent.id, current_count);
        if !added.is_empty() || !modified.is_empty() {
            let _ = self.bus.publish(&AgentEvent::EventsChanged {
                agent_id: agent.id,
                added_message_ids: added,
                modified_message_ids: modified,
            });
        }
        Ok(())
    }

    async fn process_finalized(
        &self,
        agent: &Agent,
        target: &WorkerTarget,
        message: &WorkerMessage,
        added: &mut Vec<i64>,
        modified: &mut Vec<i64>,
    ) -> Result<()> {
        let repo = self.storage.messages();
        let role: MessageRole = message.role.parse().unwrap_or(MessageRole::Assistant);
        let tools: Vec<ToolCall> = message.tools.iter().map(to_tool_call).collect();

        let Some(source_uuid) = message.source_uuid.as_deref() else {
            debug!(agent = %agent.id, "finalized message without source uuid, skipping");
            return Ok(());
        };

        // Known row: the overlap re-check. Only late tool-results write.
        if let Some(stored) = repo.get_by_source_uuid(agent.id, source_uuid).await? {
            if StoredMessage::tools_differ(&stored.tools, &tools) {
                repo.update_tools(stored.id, &tools).await?;
                modified.push(stored.id);
            }
            return Ok(());
        }

        // The streaming placeholder finalizes in place.
        if role == MessageRole::Assistant {
            if let Some(streaming) = repo.get_streaming(agent.id).await? {
                if streaming.role == MessageRole::Assistant {
                    repo.finalize_streaming(
                        streaming.id,
                        &message.content,
                        source_uuid,
                        &tools,
                        message.model.as_deref(),
                        agent.current_task_id,
                    )
                    .await?;
                    modified.push(streaming.id);
                    self.fire_tool_automations(agent, target, &tools).await;
                    return Ok(());
                }
            }
        }

        let id = repo
            .insert_finalized(
                agent.id,
                role,
                &message.content,
                message.model.as_deref(),
                message.timestamp,
                agent.current_task_id,
                &tools,
                source_uuid,
            )
            .await?;
        added.push(id);

        if role == MessageRole::Assistant && !tools.is_empty() {
            self.fire_tool_automations(agent, target, &tools).await;
        }
        Ok(())
    }

    /// Fire tool-use hooks for a finalized assistant turn. Failures are
    /// logged; ingestion never depends on them.
    async fn fire_tool_automations(&self, agent: &Agent, target: &WorkerTarget, tools: &[ToolCall]) {
        let mut read_files = Vec::new();
        let mut edited_files = Vec::new();
        let mut commands = Vec::new();
        for tool in tools {
            match tool.name.as_str() {
                "Read" | "Glob" | "Grep" => read_files.extend(tool_file_paths(tool)),
                "Edit" | "Write" | "MultiEdit" | "NotebookEdit" => {
                    edited_files.extend(tool_file_paths(tool))
                }
                "Bash" => {
                    if let Some(command) = tool.input.get("command").and_then(|v| v.as_str()) {
                        commands.push(command.to_string());
                    }
                }
                _ => {}
            }
        }

        let mut events = Vec::new();
        if !read_files.is_empty() {
            events.push(TriggerEvent::files(TriggerType::OnAfterReadFiles, read_files));
        }
        if !edited_files.is_empty() {
            events.push(TriggerEvent::files(TriggerType::OnAfterEditFiles, edited_files));
        }
        for command in commands {
            events.push(TriggerEvent::command(command));
        }
        for event in events {
            if let Err(err) = self.automations.fire(agent, target, &event).await {
                debug!(agent = %agent.id, error = %err, "tool automation failed");
            }
        }
    }

    //─────────────────────────────
    //  Automation events & actions
    //─────────────────────────────

    /// Synchronize automation executions reported by the worker.
    pub(crate) async fn sync_automation_events(
        &self,
        agent: &Agent,
        target: &WorkerTarget,
    ) -> Result<()> {
        let events = self.worker.poll_automation_events(target, POLL_TIMEOUT).await?;
        let repo = self.storage.automation_events();
        for event in events {
            let status: AutomationEventStatus = match event.status.parse() {
                Ok(status) => status,
                Err(err) => {
                    warn!(agent = %agent.id, error = %err, "unknown automation status");
                    continue;
                }
            };
            let running = repo.get_running(event.automation_id, agent.id).await?;
            match (status, running) {
                (AutomationEventStatus::Running, Some(row)) => {
                    // Running-output snapshot.
                    if row.output != event.output {
                        repo.update_output(row.id, &event.output).await?;
                    }
                }
                (AutomationEventStatus::Running, None) => {
                    repo.insert_running(event.automation_id, agent.id, &event.output, event.started_at)
                        .await?;
                }
                (terminal, Some(row)) => {
                    repo.complete(
                        row.id,
                        terminal,
                        &event.output,
                        event.exit_code,
                        event.finished_at.unwrap_or_else(chrono::Utc::now),
                    )
                    .await?;
                    self.fire_automation_finished(agent, target, event.automation_id).await;
                }
                (terminal, None) => {
                    // Fast execution that skipped the running observation.
                    repo.insert_completed(
                        event.automation_id,
                        agent.id,
                        terminal,
                        &event.output,
                        event.exit_code,
                        event.started_at,
                        event.finished_at.unwrap_or_else(chrono::Utc::now),
                    )
                    .await?;
                    self.fire_automation_finished(agent, target, event.automation_id).await;
                }
            }
        }
        Ok(())
    }

    async fn fire_automation_finished(
        &self,
        agent: &Agent,
        target: &WorkerTarget,
        finished: ariana_types::AutomationId,
    ) {
        let event = TriggerEvent::automation_finished(finished);
        if let Err(err) = self.automations.fire(agent, target, &event).await {
            debug!(agent = %agent.id, error = %err, "on_automation_finishes failed");
        }
    }

    /// Apply worker-requested side effects (`stop_agent`, `queue_prompt`).
    pub(crate) async fn apply_automation_actions(
        &self,
        agent: &Agent,
        target: &WorkerTarget,
    ) -> Result<()> {
        use ariana_types::wire::AutomationAction;

        let actions = self.worker.poll_automation_actions(target, POLL_TIMEOUT).await?;
        for action in actions {
            match action {
                AutomationAction::StopAgent => {
                    if let Err(err) = self.interrupt(agent.id).await {
                        warn!(agent = %agent.id, error = %err, "automation stop_agent failed");
                    }
                }
                AutomationAction::QueuePrompt { prompt, model } => {
                    let model = match model {
                        Some(model) => model,
                        None => self
                            .storage
                            .prompts()
                            .last_used_model(agent.id)
                            .await?
                            .unwrap_or(ModelKind::Sonnet),
                    };
                    if let Err(err) = self.queue_prompt(agent.id, prompt, model).await {
                        warn!(agent = %agent.id, error = %err, "automation queue_prompt failed");
                    }
                }
            }
        }
        Ok(())
    }

    //─────────────────────────────
    //  Context events
    //─────────────────────────────

    /// Record compaction/reset events and restart the warning ladder.
    pub(crate) async fn ingest_context_events(
        &self,
        agent: &Agent,
        target: &WorkerTarget,
    ) -> Result<()> {
        let events = self.worker.poll_context_events(target, POLL_TIMEOUT).await?;
        for event in events {
            match event.kind.as_str() {
                "compaction" | "reset" => {
                    self.context_thresholds.remove(&agent.id);
                    self.storage
                        .context_events()
                        .insert(agent.id, ContextEventKind::Compaction, None)
                        .await?;
                }
                other => debug!(agent = %agent.id, kind = other, "unknown context event"),
            }
        }
        Ok(())
    }

    //─────────────────────────────
    //  Pull-request sync
    //─────────────────────────────

    /// Sync PR state from the git host, at most once per 30s per agent.
    pub(crate) async fn sync_pull_request(&self, agent: &Agent) -> Result<()> {
        if let Some(last) = self.last_pr_sync.get(&agent.id) {
            if last.elapsed() < self.config.pr_sync_interval {
                return Ok(());
            }
        }
        self.last_pr_sync.insert(agent.id, Instant::now());

        match agent.pr_number {
            Some(number) => {
                let state = self
                    .git_host
                    .get_pull_request_state(&agent.repo_full_name, number)
                    .await
                    .context("fetching PR state")?;
                if agent.pr_state != Some(state) {
                    debug!(agent = %agent.id, pr = number, ?state, "pull request state changed");
                }
                self.storage.agents().touch_pull_request(agent.id, state).await?;
            }
            None => {
                if let Some(info) = self
                    .git_host
                    .find_latest_pr_for_branch(&agent.repo_full_name, &agent.branch_name)
                    .await
                    .context("searching PR for branch")?
                {
                    self.storage
                        .agents()
                        .set_pull_request(agent.id, info.number, info.state, Some(&info.base_branch))
                        .await?;
                }
            }
        }
        Ok(())
    }

    //─────────────────────────────
    //  Git history
    //─────────────────────────────

    pub(crate) fn git_poll_due(&self, agent: &Agent) -> bool {
        let due = match self.last_git_poll.get(&agent.id) {
            Some(last) => last.elapsed() >= self.config.git_poll_interval,
            None => true,
        };
        if due {
            self.last_git_poll.insert(agent.id, Instant::now());
        }
        due
    }

    /// Ingest commits since the last pushed cutoff, assign task ids by
    /// chronology, detect amends, and tombstone vanished commits. The poll
    /// cycle calls this on its own throttle; it is also the manual-resync
    /// entry point.
    pub async fn sync_git_history(&self, agent: &Agent, target: &WorkerTarget) -> Result<()> {
        let cutoff = agent.git_history_last_pushed_commit_sha.as_deref();
        let report = self.worker.git_history(target, cutoff, GIT_TIMEOUT).await?;

        let commits_repo = self.storage.commits();
        for wire in &report.commits {
            // An amend rewrites the SHA but keeps the author timestamp.
            if let Some(predecessor) = commits_repo
                .find_amended_predecessor(agent.id, wire.authored_at, &wire.sha)
                .await?
            {
                debug!(agent = %agent.id, old = %predecessor.commit_sha, new = %wire.sha, "amended commit");
                commits_repo.mark_deleted(&predecessor.commit_sha).await?;
            }
            let commit = self.commit_from_wire(agent, &report.branch_name, wire).await?;
            commits_repo.upsert(&commit).await?;
        }

        // Tombstones: a full fetch covers everything; a partial fetch only
        // proves unpushed commits gone (pushed ones before the cutoff were
        // simply not returned).
        let stored = commits_repo.list_live_for_agent(agent.id).await?;
        for commit in stored {
            let returned = report.commits.iter().any(|w| w.sha == commit.commit_sha);
            if !returned && (report.full_history || !commit.pushed) {
                commits_repo.mark_deleted(&commit.commit_sha).await?;
            }
        }

        // Advance the incremental cutoff to the newest pushed commit.
        if let Some(newest_pushed) = report
            .commits
            .iter()
            .filter(|w| w.pushed)
            .max_by_key(|w| w.authored_at)
        {
            self.storage
                .agents()
                .set_git_history_cursor(agent.id, Some(&newest_pushed.sha))
                .await?;
        }

        // Track the newest commit overall.
        if let Some(newest) = report.commits.iter().max_by_key(|w| w.authored_at) {
            self.storage
                .agents()
                .set_last_commit(agent.id, &newest.sha, None, newest.authored_at)
                .await?;
        }

        // The worker may have renamed the branch (first-prompt rename).
        if report.branch_name != agent.branch_name {
            self.storage.agents().set_branch_name(agent.id, &report.branch_name).await?;
        }
        Ok(())
    }

    async fn commit_from_wire(
        &self,
        agent: &Agent,
        branch_name: &str,
        wire: &WorkerCommit,
    ) -> Result<Commit> {
        // Chronology rule: the latest prompt created at or before the
        // commit's author timestamp owns it.
        let task_id = self
            .storage
            .prompts()
            .latest_created_before(agent.id, wire.authored_at)
            .await?
            .map(|p| p.id);
        Ok(Commit {
            commit_sha: wire.sha.clone(),
            agent_id: agent.id,
            branch_name: branch_name.to_string(),
            commit_message: wire.message.clone(),
            task_id,
            files_changed: wire.files_changed,
            additions: wire.additions,
            deletions: wire.deletions,
            pushed: wire.pushed,
            commit_patch: wire.patch.clone(),
            is_deleted: false,
            authored_at: wire.authored_at,
        })
    }
}

fn to_tool_call(wire: &ariana_types::wire::WorkerToolCall) -> ToolCall {
    ToolCall { name: wire.name.clone(), input: wire.input.clone(), result: wire.result.clone() }
}

fn tool_file_paths(tool: &ToolCall) -> Vec<String> {
    ["file_path", "path", "notebook_path"]
        .iter()
        .filter_map(|key| tool.input.get(key).and_then(|v| v.as_str()))
        .map(str::to_string)
        .collect()
}
