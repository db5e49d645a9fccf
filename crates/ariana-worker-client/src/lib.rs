#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-worker-client** – RPC transport to Ariana worker daemons.
//!
//! Every call is addressed by a [`WorkerTarget`] (machine address plus the
//! shared secret minted at provisioning time) and bounded by an explicit
//! per-call timeout. The controller picks the timeout class: short for
//! poll-loop reads, medium for state logic, long for git operations.
//!
//! Failures are typed ([`WorkerClientError`]) so the controller can feed
//! transient ones into its consecutive-failure budget and pattern-match the
//! rest; nothing here retries or panics.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use url::Url;

use ariana_types::wire::{
    AutomationAction, AutomationDispatch, CommitResult, ConversationsResponse,
    ExecutedAutomations, GitHistoryReport, GitStatusReport, PromptRequest, StartSetup, WorkerAck,
    WorkerAutomationEvent, WorkerContextEvent, WorkerState,
};
use ariana_types::MachineCoords;

mod error;

pub use error::{WorkerClientError, WorkerResult};
use error::NOT_INITIALIZED_MARKER;

/// Timeout for poll-loop reads (`/conversations`, event polls).
pub const POLL_TIMEOUT: Duration = Duration::from_millis(1500);

/// Timeout for state-logic calls (`/claude-state`, `/prompt`, `/interrupt`).
pub const STATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for git and setup operations (`/start`, commit, push).
pub const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Health probes at provisioning time: attempts and spacing.
pub const HEALTH_PROBE_ATTEMPTS: u32 = 5;
/// Interval between health probes.
pub const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Calls slower than this are logged for latency triage.
const SLOW_CALL: Duration = Duration::from_millis(200);

/// Address + shared secret of one worker machine.
#[derive(Debug, Clone)]
pub struct WorkerTarget {
    base: Url,
    shared_key: Secret<String>,
}

impl WorkerTarget {
    /// Build a target from a machine address (host, host:port, or full URL)
    /// and its shared secret.
    pub fn new(address: &str, shared_key: &str) -> Result<Self, url::ParseError> {
        let with_scheme = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        Ok(Self {
            base: Url::parse(&with_scheme)?,
            shared_key: Secret::new(shared_key.to_string()),
        })
    }

    /// Build a target from assigned machine coordinates.
    pub fn from_coords(coords: &MachineCoords) -> Result<Self, url::ParseError> {
        Self::new(&coords.address, &coords.shared_key)
    }

    fn join(&self, endpoint: &str) -> Url {
        // Endpoints are fixed string literals; joining cannot fail.
        self.base.join(endpoint).unwrap_or_else(|_| self.base.clone())
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", self.shared_key.expose_secret());
        if let Ok(value) = HeaderValue::from_str(&auth) {
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GitHistoryRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    since_sha: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitRequest<'a> {
    message: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenPayload<'a> {
    token: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptTextPayload<'a> {
    prompt: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RestoreHistoryRequest<'a> {
    patch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_commit_sha: Option<&'a str>,
}

/// Response of `/rename-branch-from-prompt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenamedBranch {
    /// The branch name the worker settled on.
    pub branch_name: String,
}

/// Response of `/generate-task-summary`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    /// One-line human summary of the task.
    pub summary: String,
}

/// Payload for `/update-credentials`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsPayload {
    /// Environment variables for the agent provider.
    pub environment: std::collections::HashMap<String, String>,
    /// Opaque provider configuration blob.
    pub provider_config: serde_json::Value,
}

/// Shared-client RPC transport to worker daemons.
///
/// Cheap to clone; holds one connection pool for all machines.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    client: Client,
}

impl Default for WorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerClient {
    /// Build a client. Per-call timeouts are supplied at call sites, so the
    /// client itself carries none.
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent("ariana-worker-client/0.2")
            .build()
            .unwrap_or_default();
        Self { client }
    }

    //─────────────────────────────
    //  Pull endpoints
    //─────────────────────────────

    /// `/claude-state`: readiness, blocking automations, context usage.
    pub async fn claude_state(
        &self,
        target: &WorkerTarget,
        timeout: Duration,
    ) -> WorkerResult<WorkerState> {
        self.get(target, "/claude-state", timeout).await
    }

    /// `/conversations`: the full ordered message list.
    pub async fn conversations(
        &self,
        target: &WorkerTarget,
        timeout: Duration,
    ) -> WorkerResult<ConversationsResponse> {
        self.get(target, "/conversations", timeout).await
    }

    /// `/git-history`: commits since a cutoff plus working-tree state.
    pub async fn git_history(
        &self,
        target: &WorkerTarget,
        since_sha: Option<&str>,
        timeout: Duration,
    ) -> WorkerResult<GitHistoryReport> {
        self.post(target, "/git-history", &GitHistoryRequest { since_sha }, timeout).await
    }

    /// `/git-status`: uncommitted-changes check.
    pub async fn git_status(
        &self,
        target: &WorkerTarget,
        timeout: Duration,
    ) -> WorkerResult<GitStatusReport> {
        self.get(target, "/git-status", timeout).await
    }

    /// `/poll-automation-events`: automation execution updates.
    pub async fn poll_automation_events(
        &self,
        target: &WorkerTarget,
        timeout: Duration,
    ) -> WorkerResult<Vec<WorkerAutomationEvent>> {
        self.get(target, "/poll-automation-events", timeout).await
    }

    /// `/poll-automation-actions`: side effects requested by scripts.
    pub async fn poll_automation_actions(
        &self,
        target: &WorkerTarget,
        timeout: Duration,
    ) -> WorkerResult<Vec<AutomationAction>> {
        self.get(target, "/poll-automation-actions", timeout).await
    }

    /// `/poll-context-events`: compaction / reset notifications.
    pub async fn poll_context_events(
        &self,
        target: &WorkerTarget,
        timeout: Duration,
    ) -> WorkerResult<Vec<WorkerContextEvent>> {
        self.get(target, "/poll-context-events", timeout).await
    }

    /// `/get-claude-dir`: archived assistant state for resume bundles.
    pub async fn get_claude_dir(
        &self,
        target: &WorkerTarget,
        timeout: Duration,
    ) -> WorkerResult<serde_json::Value> {
        self.get(target, "/get-claude-dir", timeout).await
    }

    //─────────────────────────────
    //  Push endpoints
    //─────────────────────────────

    /// `/start`: initial source acquisition and agent boot.
    pub async fn start(
        &self,
        target: &WorkerTarget,
        setup: &StartSetup,
        timeout: Duration,
    ) -> WorkerResult<()> {
        self.post_ack(target, "/start", setup, timeout).await
    }

    /// `/restore-git-history`: apply a patch bundle to rebuild history.
    pub async fn restore_git_history(
        &self,
        target: &WorkerTarget,
        patch: &str,
        base_commit_sha: Option<&str>,
        timeout: Duration,
    ) -> WorkerResult<()> {
        self.post_ack(
            target,
            "/restore-git-history",
            &RestoreHistoryRequest { patch, base_commit_sha },
            timeout,
        )
        .await
    }

    /// `/prompt`: dispatch a prompt with its model and task id.
    pub async fn prompt(
        &self,
        target: &WorkerTarget,
        request: &PromptRequest,
        timeout: Duration,
    ) -> WorkerResult<()> {
        self.post_ack(target, "/prompt", request, timeout).await
    }

    /// `/interrupt`: send the escape signal.
    pub async fn interrupt(&self, target: &WorkerTarget, timeout: Duration) -> WorkerResult<()> {
        self.post_ack(target, "/interrupt", &serde_json::json!({}), timeout).await
    }

    /// `/reset`: clear conversation memory.
    pub async fn reset(&self, target: &WorkerTarget, timeout: Duration) -> WorkerResult<()> {
        self.post_ack(target, "/reset", &serde_json::json!({}), timeout).await
    }

    /// `/git-commit-and-return`: commit the working tree, returning the SHA.
    pub async fn git_commit_and_return(
        &self,
        target: &WorkerTarget,
        message: &str,
        timeout: Duration,
    ) -> WorkerResult<CommitResult> {
        self.post(target, "/git-commit-and-return", &CommitRequest { message }, timeout).await
    }

    /// `/git-push`: push the agent branch.
    pub async fn git_push(&self, target: &WorkerTarget, timeout: Duration) -> WorkerResult<()> {
        self.post_ack(target, "/git-push", &serde_json::json!({}), timeout).await
    }

    /// `/execute-automations`: run a set of automations; returns the subset
    /// the worker actually started.
    pub async fn execute_automations(
        &self,
        target: &WorkerTarget,
        automations: &[AutomationDispatch],
        timeout: Duration,
    ) -> WorkerResult<ExecutedAutomations> {
        self.post(
            target,
            "/execute-automations",
            &serde_json::json!({ "automations": automations }),
            timeout,
        )
        .await
    }

    /// `/update-environment`: replace agent environment variables.
    pub async fn update_environment(
        &self,
        target: &WorkerTarget,
        environment: &std::collections::HashMap<String, String>,
        timeout: Duration,
    ) -> WorkerResult<()> {
        self.post_ack(
            target,
            "/update-environment",
            &serde_json::json!({ "environment": environment }),
            timeout,
        )
        .await
    }

    /// `/update-secrets`: replace worker-held secrets.
    pub async fn update_secrets(
        &self,
        target: &WorkerTarget,
        secrets: &std::collections::HashMap<String, String>,
        timeout: Duration,
    ) -> WorkerResult<()> {
        self.post_ack(target, "/update-secrets", &serde_json::json!({ "secrets": secrets }), timeout)
            .await
    }

    /// `/deploy-ssh-identity`: install a deploy key on the worker.
    pub async fn deploy_ssh_identity(
        &self,
        target: &WorkerTarget,
        private_key: &str,
        timeout: Duration,
    ) -> WorkerResult<()> {
        self.post_ack(
            target,
            "/deploy-ssh-identity",
            &serde_json::json!({ "privateKey": private_key }),
            timeout,
        )
        .await
    }

    /// `/update-credentials`: push the provider environment and config.
    pub async fn update_credentials(
        &self,
        target: &WorkerTarget,
        payload: &CredentialsPayload,
        timeout: Duration,
    ) -> WorkerResult<()> {
        self.post_ack(target, "/update-credentials", payload, timeout).await
    }

    /// `/update-github-token`: rotate the git-host token.
    pub async fn update_github_token(
        &self,
        target: &WorkerTarget,
        token: &str,
        timeout: Duration,
    ) -> WorkerResult<()> {
        self.post_ack(target, "/update-github-token", &TokenPayload { token }, timeout).await
    }

    /// `/update-ariana-token`: rotate the short-lived control-plane token.
    pub async fn update_ariana_token(
        &self,
        target: &WorkerTarget,
        token: &str,
        timeout: Duration,
    ) -> WorkerResult<()> {
        self.post_ack(target, "/update-ariana-token", &TokenPayload { token }, timeout).await
    }

    /// `/rename-branch-from-prompt`: derive a branch name from the first
    /// prompt. Best-effort background work.
    pub async fn rename_branch_from_prompt(
        &self,
        target: &WorkerTarget,
        prompt: &str,
        timeout: Duration,
    ) -> WorkerResult<RenamedBranch> {
        self.post(target, "/rename-branch-from-prompt", &PromptTextPayload { prompt }, timeout)
            .await
    }

    /// `/generate-task-summary`: derive a one-line summary from the prompt.
    /// Best-effort background work.
    pub async fn generate_task_summary(
        &self,
        target: &WorkerTarget,
        prompt: &str,
        timeout: Duration,
    ) -> WorkerResult<TaskSummary> {
        self.post(target, "/generate-task-summary", &PromptTextPayload { prompt }, timeout).await
    }

    //─────────────────────────────
    //  Health
    //─────────────────────────────

    /// One health probe.
    pub async fn health(&self, target: &WorkerTarget, timeout: Duration) -> WorkerResult<()> {
        let _: serde_json::Value = self.get(target, "/health", timeout).await?;
        Ok(())
    }

    /// Probe health up to [`HEALTH_PROBE_ATTEMPTS`] times at
    /// [`HEALTH_PROBE_INTERVAL`]. Provisioning fails the agent when this
    /// returns an error.
    #[instrument(skip(self, target))]
    pub async fn wait_healthy(&self, target: &WorkerTarget) -> WorkerResult<()> {
        let mut last_err = None;
        for attempt in 1..=HEALTH_PROBE_ATTEMPTS {
            match self.health(target, STATE_TIMEOUT).await {
                Ok(()) => {
                    debug!(attempt, "worker healthy");
                    return Ok(());
                }
                Err(err) => {
                    debug!(attempt, error = %err, "health probe failed");
                    last_err = Some(err);
                }
            }
            if attempt < HEALTH_PROBE_ATTEMPTS {
                tokio::time::sleep(HEALTH_PROBE_INTERVAL).await;
            }
        }
        Err(last_err.unwrap_or(WorkerClientError::Timeout {
            endpoint: "/health",
            timeout: STATE_TIMEOUT,
        }))
    }

    //─────────────────────────────
    //  Transport
    //─────────────────────────────

    async fn get<T: DeserializeOwned>(
        &self,
        target: &WorkerTarget,
        endpoint: &'static str,
        timeout: Duration,
    ) -> WorkerResult<T> {
        let started = Instant::now();
        let response = self
            .client
            .get(target.join(endpoint))
            .headers(target.headers())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(e, endpoint, timeout))?;
        let result = self.decode(response, endpoint).await;
        log_slow(endpoint, started.elapsed());
        result
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        target: &WorkerTarget,
        endpoint: &'static str,
        body: &B,
        timeout: Duration,
    ) -> WorkerResult<T> {
        let started = Instant::now();
        let response = self
            .client
            .post(target.join(endpoint))
            .headers(target.headers())
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, endpoint, timeout))?;
        let result = self.decode(response, endpoint).await;
        log_slow(endpoint, started.elapsed());
        result
    }

    /// POST an operation whose response is a [`WorkerAck`]; surface
    /// `success = false` as `Semantic` (or `NotInitialized`).
    async fn post_ack<B: Serialize + ?Sized>(
        &self,
        target: &WorkerTarget,
        endpoint: &'static str,
        body: &B,
        timeout: Duration,
    ) -> WorkerResult<()> {
        let ack: WorkerAck = self.post(target, endpoint, body, timeout).await?;
        if ack.success {
            return Ok(());
        }
        let message = ack.error.unwrap_or_else(|| "unspecified failure".to_string());
        if message.to_ascii_lowercase().contains(NOT_INITIALIZED_MARKER) {
            Err(WorkerClientError::NotInitialized { endpoint })
        } else {
            Err(WorkerClientError::Semantic { endpoint, message })
        }
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        endpoint: &'static str,
    ) -> WorkerResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.to_ascii_lowercase().contains(NOT_INITIALIZED_MARKER) {
                return Err(WorkerClientError::NotInitialized { endpoint });
            }
            return Err(WorkerClientError::Status { endpoint, status: status.as_u16(), body });
        }
        response
            .json()
            .await
            .map_err(|source| WorkerClientError::InvalidResponse { endpoint, source })
    }
}

fn map_transport_error(
    err: reqwest::Error,
    endpoint: &'static str,
    timeout: Duration,
) -> WorkerClientError {
    if err.is_timeout() {
        WorkerClientError::Timeout { endpoint, timeout }
    } else {
        WorkerClientError::Connect { endpoint, source: err }
    }
}

fn log_slow(endpoint: &str, elapsed: Duration) {
    if elapsed > SLOW_CALL {
        warn!(endpoint, elapsed_ms = elapsed.as_millis() as u64, "slow worker call");
    }
}
