//! Top-level tick loop: per-agent fan-out, lifecycle-map sweeping, and
//! lifetime accounting.
//!
//! Each tick runs one poll cycle and one state-logic step per pollable
//! agent, in parallel across agents, with failures isolated per agent.
//! The sweeper then prunes every per-agent map against the live set so
//! dead agents cannot leak process memory.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use ariana_types::{Agent, AgentId};

use crate::controller::AgentController;

impl AgentController {
    /// Drive the controller until `shutdown` flips. In-flight worker RPCs
    /// cancel via their per-call deadlines.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("controller loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("controller loop stopping");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick_all().await {
                        warn!(error = %err, "tick failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// One tick over every pollable agent.
    pub async fn tick_all(self: &Arc<Self>) -> Result<()> {
        let agents = self.storage.agents().list_pollable().await?;
        let cycles = agents.iter().map(|agent| {
            let controller = Arc::clone(self);
            async move {
                let last_count =
                    controller.last_message_count.get(&agent.id).map(|e| *e).unwrap_or(0);
                let (poll, step) = tokio::join!(
                    controller.poll_once(agent),
                    controller.step_state(agent, last_count),
                );
                if let Err(err) = poll {
                    debug!(agent = %agent.id, error = %err, "poll cycle failed");
                }
                if let Err(err) = step {
                    debug!(agent = %agent.id, error = %err, "state step failed");
                }
                if let Err(err) = controller.charge_lifetime(agent).await {
                    debug!(agent = %agent.id, error = %err, "lifetime accounting failed");
                }
                controller.refresh_credentials_if_due(agent).await;
            }
        });
        join_all(cycles).await;

        let alive: HashSet<AgentId> = agents.iter().map(|a| a.id).collect();
        self.sweep(&alive);
        Ok(())
    }

    /// Burn one lifetime slice per elapsed unit of wall-clock time.
    /// Reaching zero only flags the agent; archival is scheduled upstream.
    async fn charge_lifetime(&self, agent: &Agent) -> Result<()> {
        let unit = std::time::Duration::from_secs(self.config.lifetime_unit_minutes * 60);
        let due = match self.last_lifetime_charge.get(&agent.id) {
            Some(last) => last.elapsed() >= unit,
            None => {
                self.last_lifetime_charge.insert(agent.id, Instant::now());
                false
            }
        };
        if !due {
            return Ok(());
        }
        self.last_lifetime_charge.insert(agent.id, Instant::now());
        let remaining = self.storage.agents().decrement_lifetime(agent.id, 1).await?;
        if remaining == 0 {
            info!(agent = %agent.id, "lifetime budget exhausted, archival due");
        }
        Ok(())
    }

    /// Keep worker-held credentials fresh while the agent sits idle or
    /// runs long tasks. The prompt pump also refreshes and resets the
    /// clock, so busy agents are not double-pushed.
    async fn refresh_credentials_if_due(&self, agent: &Agent) {
        if !matches!(agent.state, ariana_types::AgentState::Idle | ariana_types::AgentState::Running)
        {
            return;
        }
        let due = match self.last_credential_refresh.get(&agent.id) {
            Some(last) => last.elapsed() >= self.config.credential_refresh_interval,
            None => {
                // First sight: start the clock; the pump covers the
                // initial push.
                self.last_credential_refresh.insert(agent.id, Instant::now());
                false
            }
        };
        if !due {
            return;
        }
        self.last_credential_refresh.insert(agent.id, Instant::now());
        let target = match self.worker_target(agent) {
            Ok(target) => target,
            Err(err) => {
                debug!(agent = %agent.id, error = %err, "no target for credential refresh");
                return;
            }
        };
        if let Err(err) =
            self.credentials.refresh_on_worker(agent.user_id, agent.id, &target).await
        {
            debug!(agent = %agent.id, error = %err, "periodic credential refresh failed");
        }
    }

    /// Prune every per-agent map against the live set. The maps are
    /// treated as a consistent snapshot at call time.
    pub(crate) fn sweep(&self, alive: &HashSet<AgentId>) {
        self.consecutive_failures.retain(|id, _| alive.contains(id));
        self.context_thresholds.retain(|id, _| alive.contains(id));
        self.last_git_poll.retain(|id, _| alive.contains(id));
        self.last_pr_sync.retain(|id, _| alive.contains(id));
        self.last_message_count.retain(|id, _| alive.contains(id));
        self.unproductive_since.retain(|id, _| alive.contains(id));
        self.last_lifetime_charge.retain(|id, _| alive.contains(id));
        self.last_credential_refresh.retain(|id, _| alive.contains(id));
        self.credentials.prune(&|id| alive.contains(&id));
    }
}
