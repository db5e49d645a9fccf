//! Agent lifecycle operations: creation, provisioning, source acquisition,
//! prompt queueing, interrupts, trash.
//!
//! The controller is the single writer of `Agent.state`. Every transition
//! goes through [`AgentController::transition`], which enforces the state
//! table in storage and publishes a change notification.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use ariana_automations::{AutomationEngine, TriggerEvent};
use ariana_bus::{AgentEvent, AgentEventBus};
use ariana_credentials::{CredentialService, GitHostClient};
use ariana_pool::{MachinePool, PoolError};
use ariana_storage::Storage;
use ariana_types::wire::StartSetup;
use ariana_types::{
    Agent, AgentId, AgentState, MachineId, MachineType, ModelKind, Prompt, PromptId, ProjectId,
    TriggerType, UserId,
};
use ariana_worker_client::{WorkerClient, WorkerClientError, WorkerTarget, STATE_TIMEOUT};

use crate::config::ControllerConfig;

/// Slow-path threshold for agent row lookups.
const SLOW_DB_LOOKUP: std::time::Duration = std::time::Duration::from_millis(50);

/// Typed failures of the controller's public operations.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Unknown agent id.
    #[error("agent {0} not found")]
    NotFound(AgentId),

    /// The operation requires a different lifecycle state.
    #[error("agent {id} is {actual:?}, expected {expected:?}")]
    WrongState {
        /// Agent concerned.
        id: AgentId,
        /// State the operation requires.
        expected: AgentState,
        /// State the agent is in.
        actual: AgentState,
    },

    /// The machine pool refused (capacity, cancelled reservation, ...).
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The worker daemon is up but the agent process has not booted;
    /// the interrupt path refuses to clear state in that case.
    #[error("worker not initialized; refusing to clear agent state")]
    WorkerNotInitialized,

    /// Anything else (storage, serialization).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result alias for controller operations.
pub type ControllerResult<T> = std::result::Result<T, ControllerError>;

/// Parameters of [`AgentController::create`].
#[derive(Debug, Clone)]
pub struct CreateAgentRequest {
    /// Creating user; granted write access.
    pub user_id: UserId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Repository to clone, as `owner/name`.
    pub repo_full_name: String,
    /// Branch the agent branches from; the repo default when absent.
    pub base_branch: Option<String>,
    /// Display name; generated when absent.
    pub name: Option<String>,
    /// Execution-environment preset.
    pub environment_id: Option<String>,
    /// Pool (default) or custom placement.
    pub machine_type: Option<MachineType>,
    /// Machine to claim when `machine_type` is custom.
    pub custom_machine_id: Option<MachineId>,
}

/// The per-agent state machine and its collaborators.
///
/// All per-agent in-process maps live here (not in module statics) so that
/// a controller instance owns its memory and the sweeper can reclaim it.
pub struct AgentController {
    pub(crate) storage: Storage,
    pub(crate) worker: WorkerClient,
    pub(crate) pool: MachinePool,
    pub(crate) credentials: Arc<CredentialService>,
    pub(crate) automations: AutomationEngine,
    pub(crate) git_host: Arc<dyn GitHostClient>,
    pub(crate) bus: Arc<dyn AgentEventBus>,
    pub(crate) config: ControllerConfig,

    // Lifecycle-scope maps, pruned by the sweeper.
    pub(crate) consecutive_failures: DashMap<AgentId, u32>,
    pub(crate) context_thresholds: DashMap<AgentId, f64>,
    pub(crate) last_git_poll: DashMap<AgentId, Instant>,
    pub(crate) last_pr_sync: DashMap<AgentId, Instant>,
    pub(crate) last_message_count: DashMap<AgentId, usize>,
    pub(crate) unproductive_since: DashMap<AgentId, Instant>,
    pub(crate) last_lifetime_charge: DashMap<AgentId, Instant>,
    pub(crate) last_credential_refresh: DashMap<AgentId, Instant>,
}

impl AgentController {
    /// Build a controller and run the startup sweep for streaming rows a
    /// previous process may have left behind.
    pub async fn new(
        storage: Storage,
        worker: WorkerClient,
        pool: MachinePool,
        credentials: Arc<CredentialService>,
        automations: AutomationEngine,
        git_host: Arc<dyn GitHostClient>,
        bus: Arc<dyn AgentEventBus>,
        config: ControllerConfig,
    ) -> Result<Arc<Self>> {
        let orphans = storage.messages().clear_orphaned_streaming().await?;
        if orphans > 0 {
            info!(orphans, "cleared orphaned streaming messages at startup");
        }
        Ok(Arc::new(Self {
            storage,
            worker,
            pool,
            credentials,
            automations,
            git_host,
            bus,
            config,
            consecutive_failures: DashMap::new(),
            context_thresholds: DashMap::new(),
            last_git_poll: DashMap::new(),
            last_pr_sync: DashMap::new(),
            last_message_count: DashMap::new(),
            unproductive_since: DashMap::new(),
            last_lifetime_charge: DashMap::new(),
            last_credential_refresh: DashMap::new(),
        }))
    }

    //─────────────────────────────
    //  Creation & provisioning
    //─────────────────────────────

    /// Register a new agent in `PROVISIONING` and fire provisioning in the
    /// background. Refused when the pool is at capacity.
    #[instrument(skip(self, request), fields(user = %request.user_id, project = %request.project_id))]
    pub async fn create(self: &Arc<Self>, request: CreateAgentRequest) -> ControllerResult<AgentId> {
        self.pool.ensure_capacity().await?;

        let name = request
            .name
            .unwrap_or_else(|| format!("agent-{}", &Uuid::new_v4().simple().to_string()[..8]));
        let branch_name = format!("ariana/{}", slugify(&name));
        let machine_type = request.machine_type.unwrap_or(MachineType::Pool);

        // Callers may omit the base branch; resolve it against the
        // repository default so the agent never carries an empty one.
        let base_branch = match request.base_branch {
            Some(branch) => branch,
            None => self
                .git_host
                .get_default_branch(&request.repo_full_name)
                .await
                .context("resolving repository default branch")?,
        };

        let mut agent = Agent::provisioning(
            request.user_id,
            request.project_id,
            name,
            branch_name,
            request.repo_full_name,
            machine_type,
            self.config.default_lifetime_units,
        );
        agent.pr_base_branch = Some(base_branch);
        agent.environment_id = request.environment_id;

        self.storage.agents().insert(&agent).await.map_err(ControllerError::Other)?;
        self.storage
            .access()
            .grant_write(request.user_id, agent.id)
            .await
            .map_err(ControllerError::Other)?;
        info!(agent = %agent.id, ?machine_type, "agent registered");

        let controller = Arc::clone(self);
        let agent_id = agent.id;
        let custom_machine = request.custom_machine_id;
        tokio::spawn(async move {
            if let Err(err) = controller.provision(agent_id, custom_machine).await {
                error!(agent = %agent_id, error = %err, "provisioning failed");
            }
        });

        Ok(agent_id)
    }

    /// Drive an agent from `PROVISIONING` to `PROVISIONED`: acquire a
    /// machine, wait for health, push the service-preview token.
    #[instrument(skip(self))]
    pub(crate) async fn provision(
        &self,
        agent_id: AgentId,
        custom_machine: Option<MachineId>,
    ) -> Result<()> {
        let agent = self.load_agent(agent_id).await?;
        let result = match agent.machine_type {
            MachineType::Pool => self.provision_from_pool(&agent).await,
            MachineType::Custom => self.provision_custom(&agent, custom_machine).await,
        };
        if let Err(err) = result {
            self.transition(agent_id, AgentState::Error, Some(&err.to_string())).await?;
            self.storage.prompts().fail_active(agent_id).await?;
            return Err(err);
        }
        self.transition(agent_id, AgentState::Provisioned, None).await?;
        Ok(())
    }

    async fn provision_from_pool(&self, agent: &Agent) -> Result<()> {
        let reservation = self.pool.reserve(agent.id).await?;
        let coords = match self
            .pool
            .wait_for_assignment(reservation.id, self.config.reservation_wait)
            .await
        {
            Ok(coords) => coords,
            Err(err) => {
                // Leave no dangling queue entry behind.
                self.pool.cancel(reservation.id).await?;
                return Err(err.into());
            }
        };
        self.storage.agents().attach_machine(agent.id, &coords).await?;

        let target = WorkerTarget::from_coords(&coords).context("bad machine address")?;
        self.worker.wait_healthy(&target).await.context("worker never became healthy")?;
        self.push_preview_token(agent.id, &target).await?;

        self.pool.fulfill(reservation.id).await?;
        Ok(())
    }

    async fn provision_custom(
        &self,
        agent: &Agent,
        requested: Option<MachineId>,
    ) -> Result<()> {
        let machine_id = match requested.or_else(|| agent.machine_id.clone()) {
            Some(id) => id,
            None => match self.storage.machines().find_by_agent(agent.id).await? {
                Some(machine) => machine.machine_id,
                None => return Err(anyhow!("no custom machine selected for agent {}", agent.id)),
            },
        };
        let coords = self.pool.claim_custom(&machine_id, agent.id, agent.user_id).await?;
        self.storage.agents().attach_machine(agent.id, &coords).await?;

        let target = WorkerTarget::from_coords(&coords).context("bad machine address")?;
        if let Err(err) = self.worker.wait_healthy(&target).await {
            // Compensate: return the machine and detach it from the agent.
            self.pool.release(&machine_id).await?;
            self.storage.agents().reset_machine_fields(agent.id).await?;
            return Err(anyhow!(err).context("custom machine failed health check"));
        }
        self.push_preview_token(agent.id, &target).await?;
        Ok(())
    }

    async fn push_preview_token(&self, agent_id: AgentId, target: &WorkerTarget) -> Result<()> {
        let token = Uuid::new_v4().simple().to_string();
        let mut secrets = std::collections::HashMap::new();
        secrets.insert("SERVICE_PREVIEW_TOKEN".to_string(), token.clone());
        self.worker
            .update_secrets(target, &secrets, STATE_TIMEOUT)
            .await
            .context("pushing service-preview token")?;
        self.storage.agents().mark_provisioned(agent_id, &token).await?;
        Ok(())
    }

    /// From `PROVISIONED`, perform source acquisition on the worker and
    /// drive the agent to `READY`.
    #[instrument(skip(self, setup))]
    pub async fn start(&self, agent_id: AgentId, setup: StartSetup) -> ControllerResult<()> {
        let agent = self.load_agent(agent_id).await?;
        if agent.state != AgentState::Provisioned {
            return Err(ControllerError::WrongState {
                id: agent_id,
                expected: AgentState::Provisioned,
                actual: agent.state,
            });
        }
        let target = self.worker_target(&agent)?;

        self.transition(agent_id, AgentState::Cloning, None).await?;
        match self
            .worker
            .start(&target, &setup, ariana_worker_client::GIT_TIMEOUT)
            .await
        {
            Ok(()) => {
                self.transition(agent_id, AgentState::Ready, None).await?;
                Ok(())
            }
            Err(err) => {
                self.transition(agent_id, AgentState::Error, Some(&err.to_string())).await?;
                Err(ControllerError::Other(anyhow!(err).context("worker /start failed")))
            }
        }
    }

    /// Re-enter `PROVISIONING` from `ARCHIVED`, preserving the original
    /// machine type.
    pub async fn resume_archived(self: &Arc<Self>, agent_id: AgentId) -> ControllerResult<()> {
        self.resume_from(agent_id, AgentState::Archived).await
    }

    /// Re-enter `PROVISIONING` from `ERROR`, preserving the original
    /// machine type.
    pub async fn resume_error(self: &Arc<Self>, agent_id: AgentId) -> ControllerResult<()> {
        self.resume_from(agent_id, AgentState::Error).await
    }

    async fn resume_from(self: &Arc<Self>, agent_id: AgentId, expected: AgentState) -> ControllerResult<()> {
        let agent = self.load_agent(agent_id).await?;
        if agent.state != expected {
            return Err(ControllerError::WrongState { id: agent_id, expected, actual: agent.state });
        }
        self.storage.agents().reset_machine_fields(agent_id).await.map_err(ControllerError::Other)?;
        self.transition(agent_id, AgentState::Provisioning, None).await?;
        info!(agent = %agent_id, from = ?expected, "agent resumed");

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = controller.provision(agent_id, None).await {
                error!(agent = %agent_id, error = %err, "re-provisioning failed");
            }
        });
        Ok(())
    }

    //─────────────────────────────
    //  Prompts & interrupts
    //─────────────────────────────

    /// Append a prompt to the agent's FIFO queue.
    pub async fn queue_prompt(
        &self,
        agent_id: AgentId,
        text: String,
        model: ModelKind,
    ) -> ControllerResult<PromptId> {
        let _ = self.load_agent(agent_id).await?;
        let prompt = Prompt::new(agent_id, text, model).map_err(|e| ControllerError::Other(anyhow!(e)))?;
        self.storage.prompts().queue(&prompt).await.map_err(ControllerError::Other)?;
        info!(agent = %agent_id, prompt = %prompt.id, model = model.as_str(), "prompt queued");
        Ok(prompt.id)
    }

    /// Signal the worker to stop, finish running prompts as interrupted,
    /// clear the gate flags, and force `IDLE`.
    ///
    /// A worker whose agent process has not booted cannot be meaningfully
    /// interrupted; that case is surfaced without touching state.
    #[instrument(skip(self))]
    pub async fn interrupt(&self, agent_id: AgentId) -> ControllerResult<()> {
        let agent = self.load_agent(agent_id).await?;
        let target = self.worker_target(&agent)?;

        match self.worker.interrupt(&target, STATE_TIMEOUT).await {
            Ok(()) => {}
            Err(WorkerClientError::NotInitialized { .. }) => {
                return Err(ControllerError::WorkerNotInitialized);
            }
            Err(err) if err.is_transient() => {
                warn!(agent = %agent_id, error = %err, "interrupt best-effort: worker unreachable");
            }
            Err(err) => return Err(ControllerError::Other(anyhow!(err))),
        }

        self.storage.prompts().finish_running(agent_id).await.map_err(ControllerError::Other)?;
        self.storage.agents().set_pending_commit(agent_id, false).await.map_err(ControllerError::Other)?;
        self.storage.agents().set_pending_push_pr(agent_id, false).await.map_err(ControllerError::Other)?;
        if agent.state == AgentState::Running || agent.state == AgentState::Ready {
            self.transition(agent_id, AgentState::Idle, None).await?;
        }
        Ok(())
    }

    /// Soft-delete: the controller skips the agent until untrashed.
    pub async fn trash(&self, agent_id: AgentId) -> ControllerResult<()> {
        let _ = self.load_agent(agent_id).await?;
        self.storage.agents().set_trashed(agent_id, true).await.map_err(ControllerError::Other)?;
        Ok(())
    }

    /// Undo a soft-delete.
    pub async fn untrash(&self, agent_id: AgentId) -> ControllerResult<()> {
        let _ = self.load_agent(agent_id).await?;
        self.storage.agents().set_trashed(agent_id, false).await.map_err(ControllerError::Other)?;
        Ok(())
    }

    /// Fire the `on_agent_ready` hook. Exposed for the state tick.
    pub(crate) async fn fire_agent_ready(&self, agent: &Agent, target: &WorkerTarget) -> Result<()> {
        self.automations
            .fire(agent, target, &TriggerEvent::lifecycle(TriggerType::OnAgentReady))
            .await?;
        Ok(())
    }

    //─────────────────────────────
    //  Shared helpers
    //─────────────────────────────

    /// Load an agent, logging slow lookups.
    pub(crate) async fn load_agent(&self, agent_id: AgentId) -> ControllerResult<Agent> {
        let started = Instant::now();
        let agent = self
            .storage
            .agents()
            .get(agent_id)
            .await
            .map_err(ControllerError::Other)?
            .ok_or(ControllerError::NotFound(agent_id))?;
        let elapsed = started.elapsed();
        if elapsed > SLOW_DB_LOOKUP {
            warn!(agent = %agent_id, elapsed_ms = elapsed.as_millis() as u64, "slow agent lookup");
        }
        Ok(agent)
    }

    /// Resolve the RPC target from the agent's machine fields.
    pub(crate) fn worker_target(&self, agent: &Agent) -> ControllerResult<WorkerTarget> {
        let address = agent
            .machine_address
            .as_deref()
            .ok_or_else(|| ControllerError::Other(anyhow!("agent {} has no machine", agent.id)))?;
        let key = agent
            .machine_shared_key
            .as_deref()
            .ok_or_else(|| ControllerError::Other(anyhow!("agent {} has no shared key", agent.id)))?;
        WorkerTarget::new(address, key)
            .map_err(|e| ControllerError::Other(anyhow!("bad machine address: {e}")))
    }

    /// Single choke point for state writes: enforce the table in storage,
    /// publish the change.
    pub(crate) async fn transition(
        &self,
        agent_id: AgentId,
        to: AgentState,
        error_message: Option<&str>,
    ) -> ControllerResult<()> {
        self.storage
            .agents()
            .set_state(agent_id, to, error_message)
            .await
            .map_err(ControllerError::Other)?;
        let _ = self.bus.publish(&AgentEvent::StateChanged { agent_id, state: to });
        Ok(())
    }

    /// Fail all active prompts and drive the agent to `ERROR`. Shared by
    /// machine-death and ghost detection.
    pub(crate) async fn fail_agent(&self, agent_id: AgentId, reason: &str) -> Result<()> {
        let failed = self.storage.prompts().fail_active(agent_id).await?;
        self.transition(agent_id, AgentState::Error, Some(reason)).await?;
        self.prune_agent_maps(agent_id);
        warn!(agent = %agent_id, failed_prompts = failed, reason, "agent failed");
        Ok(())
    }

    /// Drop every per-agent map entry.
    pub(crate) fn prune_agent_maps(&self, agent_id: AgentId) {
        self.consecutive_failures.remove(&agent_id);
        self.context_thresholds.remove(&agent_id);
        self.last_git_poll.remove(&agent_id);
        self.last_pr_sync.remove(&agent_id);
        self.last_message_count.remove(&agent_id);
        self.unproductive_since.remove(&agent_id);
        self.last_lifetime_charge.remove(&agent_id);
        self.last_credential_refresh.remove(&agent_id);
    }
}

/// Lowercase a name into a branch-safe slug.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Fix the README!"), "fix-the-readme");
        assert_eq!(slugify("agent 42"), "agent-42");
        assert_eq!(slugify("--weird--"), "weird");
    }
}
