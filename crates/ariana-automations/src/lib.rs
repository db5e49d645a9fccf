#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-automations** – Lifecycle hook engine.
//!
//! Computes the set of user automations matching a trigger event,
//! deduplicates against executions already in flight (and, for
//! `on_before_commit`, against runs since the last commit), and ships the
//! survivors to the worker. The worker answers with the subset it actually
//! started; only *blocking* automations inside that subset gate the
//! commit/push the controller is orchestrating.

use anyhow::Result;
use regex::Regex;
use tracing::{debug, instrument, warn};

use ariana_storage::Storage;
use ariana_types::wire::AutomationDispatch;
use ariana_types::{Agent, Automation, AutomationId, TriggerType};
use ariana_worker_client::{WorkerClient, WorkerTarget, STATE_TIMEOUT};

pub mod matching;

pub use matching::{glob_to_regex, matches_trigger, TriggerEvent};

/// Result of firing a trigger: what the worker started, and which of those
/// the controller must wait on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FireOutcome {
    /// Automations the worker accepted and started.
    pub executed: Vec<AutomationId>,
    /// The blocking subset of `executed`.
    pub blocking: Vec<AutomationId>,
}

impl FireOutcome {
    /// Whether the caller has anything to wait for.
    pub fn has_blocking(&self) -> bool {
        !self.blocking.is_empty()
    }
}

/// Matches triggers to automations and dispatches them to workers.
#[derive(Debug, Clone)]
pub struct AutomationEngine {
    storage: Storage,
    worker: WorkerClient,
}

impl AutomationEngine {
    /// Build the engine over storage and the shared worker client.
    pub fn new(storage: Storage, worker: WorkerClient) -> Self {
        Self { storage, worker }
    }

    /// Fire a trigger for one agent: match, dedup, dispatch.
    #[instrument(skip(self, agent, target, event), fields(agent_id = %agent.id, trigger = ?event.trigger))]
    pub async fn fire(
        &self,
        agent: &Agent,
        target: &WorkerTarget,
        event: &TriggerEvent,
    ) -> Result<FireOutcome> {
        let candidates = self
            .storage
            .automations()
            .list_for_trigger(agent.project_id, event.trigger)
            .await?;
        if candidates.is_empty() {
            return Ok(FireOutcome::default());
        }

        let mut selected = Vec::new();
        for automation in candidates {
            if !matches_trigger(&automation, event) {
                continue;
            }
            if self.should_skip(agent, &automation).await? {
                debug!(automation = %automation.id, "skipping deduplicated automation");
                continue;
            }
            selected.push(automation);
        }
        if selected.is_empty() {
            return Ok(FireOutcome::default());
        }

        let dispatches: Vec<AutomationDispatch> = selected
            .iter()
            .map(|a| AutomationDispatch {
                id: a.id,
                name: a.name.clone(),
                script_language: a.script_language,
                script_content: a.script_content.clone(),
                blocking: a.blocking,
                feed_output: a.feed_output,
            })
            .collect();

        let executed = self
            .worker
            .execute_automations(target, &dispatches, STATE_TIMEOUT)
            .await?
            .executed_ids;

        if executed.len() < dispatches.len() {
            warn!(
                requested = dispatches.len(),
                executed = executed.len(),
                "worker declined some automations"
            );
        }

        let blocking = selected
            .iter()
            .filter(|a| a.blocking && executed.contains(&a.id))
            .map(|a| a.id)
            .collect();

        Ok(FireOutcome { executed, blocking })
    }

    /// Dedup rules: never start an automation that is still running; for
    /// `on_before_commit`, skip anything that already ran since the last
    /// commit (the gate re-enters this path on every tick while waiting).
    async fn should_skip(&self, agent: &Agent, automation: &Automation) -> Result<bool> {
        let events = self.storage.automation_events();
        if events.get_running(automation.id, agent.id).await?.is_some() {
            return Ok(true);
        }
        if automation.trigger.trigger_type == TriggerType::OnBeforeCommit {
            let since = agent.last_commit_at.unwrap_or(agent.created_at);
            if events.ran_since(automation.id, agent.id, since).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Compile a command-regex filter, treating an invalid pattern as
/// match-nothing rather than an error at fire time.
pub(crate) fn compile_filter(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            warn!(pattern, error = %err, "invalid automation filter regex");
            None
        }
    }
}
