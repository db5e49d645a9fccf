#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ariana-credentials** – Credential rotation for agents.
//!
//! On every prompt dispatch, and periodically while an agent is idle or
//! running, the controller pushes fresh credentials to the worker:
//!
//! 1. the agent-provider environment (OAuth subscription or API key),
//! 2. a git-host installation token (throttled per agent),
//! 3. a short-lived control-plane token minted by [`ariana_auth`].
//!
//! The encrypted credential store and the git-hosting integration are
//! external collaborators; this crate defines their contracts
//! ([`CredentialProvider`], [`GitHostClient`]) and owns the rotation
//! policy: freshness windows, per-agent throttles, and environment
//! assembly per auth method.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, Secret};
use tracing::{debug, warn};

use ariana_auth::TokenMinter;
use ariana_types::{AgentId, PullRequestState, UserId};
use ariana_worker_client::{CredentialsPayload, WorkerClient, WorkerTarget, STATE_TIMEOUT};

/// Refresh the OAuth token when it expires within this many seconds.
pub const OAUTH_FRESHNESS_WINDOW_SECS: i64 = 5 * 60;

/// Minimum spacing between git-host token refreshes per agent.
pub const GITHUB_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

//─────────────────────────────
//  Collaborator contracts
//─────────────────────────────

/// An OAuth access token with its expiry.
#[derive(Clone)]
pub struct OAuthToken {
    /// Bearer token value.
    pub access_token: Secret<String>,
    /// Absolute expiry.
    pub expires_at: DateTime<Utc>,
}

impl OAuthToken {
    /// Whether the token is still fresh at `now` given the refresh window.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (self.expires_at - now).num_seconds() > OAUTH_FRESHNESS_WINDOW_SECS
    }
}

/// Auth method a user configured for the agent provider.
#[derive(Clone)]
pub enum AuthMethod {
    /// OAuth subscription; token comes from the provider's token store.
    OauthSubscription,
    /// Direct Anthropic API key.
    AnthropicApiKey {
        /// The key.
        key: Secret<String>,
    },
    /// OpenRouter API key, routed through a custom base URL.
    OpenrouterApiKey {
        /// The key.
        key: Secret<String>,
        /// Base URL the worker should point the provider SDK at.
        base_url: String,
    },
}

/// Active credentials for a user: the auth method plus an opaque provider
/// configuration blob forwarded verbatim to the worker.
#[derive(Clone)]
pub struct ActiveCredentials {
    /// Configured auth method.
    pub auth: AuthMethod,
    /// Provider configuration forwarded to `/update-credentials`.
    pub config: serde_json::Value,
}

/// Contract of the encrypted credential store.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The user's active credentials.
    async fn get_active_credentials(&self, user: UserId) -> Result<ActiveCredentials>;

    /// The stored OAuth token, if the user uses a subscription.
    async fn get_valid_oauth_token(&self, user: UserId) -> Result<Option<OAuthToken>>;

    /// Force a refresh, recording any new refresh/access tokens.
    async fn refresh_oauth_token(&self, user: UserId) -> Result<Option<OAuthToken>>;
}

/// Coordinates of a pull request found for a branch.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequestInfo {
    /// PR number.
    pub number: i64,
    /// Current state.
    pub state: PullRequestState,
    /// Branch the PR merges into.
    pub base_branch: String,
}

/// Contract of the git-hosting integration.
///
/// Implementations must not delete stored tokens on transient errors;
/// deletion is reserved for explicit re-auth flows.
#[async_trait]
pub trait GitHostClient: Send + Sync {
    /// A currently valid installation token for the user, if one exists.
    async fn get_valid_token(&self, user: UserId) -> Result<Option<Secret<String>>>;

    /// Refresh the user's token. `None` means the grant is gone and the
    /// user must re-authenticate.
    async fn refresh_token(&self, user: UserId) -> Result<Option<Secret<String>>>;

    /// State of one pull request.
    async fn get_pull_request_state(
        &self,
        repo_full_name: &str,
        pr_number: i64,
    ) -> Result<PullRequestState>;

    /// The most recent PR whose head is `branch`.
    async fn find_latest_pr_for_branch(
        &self,
        repo_full_name: &str,
        branch: &str,
    ) -> Result<Option<PullRequestInfo>>;

    /// Default branch of a repository.
    async fn get_default_branch(&self, repo_full_name: &str) -> Result<String>;
}

//─────────────────────────────
//  Environment assembly
//─────────────────────────────

/// Build the provider environment for an auth method.
///
/// OAuth subscriptions inject `CLAUDE_CODE_OAUTH_TOKEN`; Anthropic API keys
/// inject `ANTHROPIC_API_KEY`; OpenRouter keys point the SDK at the router
/// base URL and blank the API key so the SDK prefers the auth token.
pub fn build_environment(
    auth: &AuthMethod,
    oauth_token: Option<&OAuthToken>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    match auth {
        AuthMethod::OauthSubscription => {
            if let Some(token) = oauth_token {
                env.insert(
                    "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
                    token.access_token.expose_secret().clone(),
                );
            }
        }
        AuthMethod::AnthropicApiKey { key } => {
            env.insert("ANTHROPIC_API_KEY".to_string(), key.expose_secret().clone());
        }
        AuthMethod::OpenrouterApiKey { key, base_url } => {
            env.insert("ANTHROPIC_BASE_URL".to_string(), base_url.clone());
            env.insert("ANTHROPIC_AUTH_TOKEN".to_string(), key.expose_secret().clone());
            env.insert("ANTHROPIC_API_KEY".to_string(), String::new());
        }
    }
    env
}

//─────────────────────────────
//  Credential service
//─────────────────────────────

/// Outcome of one credential refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// A git-host token was pushed this round (throttle allowed it).
    pub github_refreshed: bool,
    /// The git-host grant is gone; the user must re-authenticate.
    pub reauth_required: bool,
}

/// Pushes fresh credentials to workers with per-agent throttling.
pub struct CredentialService {
    provider: Arc<dyn CredentialProvider>,
    git_host: Arc<dyn GitHostClient>,
    minter: TokenMinter,
    worker: WorkerClient,
    last_github_refresh: DashMap<AgentId, Instant>,
}

impl CredentialService {
    /// Build the service over its collaborators.
    pub fn new(
        provider: Arc<dyn CredentialProvider>,
        git_host: Arc<dyn GitHostClient>,
        minter: TokenMinter,
        worker: WorkerClient,
    ) -> Self {
        Self { provider, git_host, minter, worker, last_github_refresh: DashMap::new() }
    }

    /// Access the git-host collaborator (PR sync shares it).
    pub fn git_host(&self) -> Arc<dyn GitHostClient> {
        self.git_host.clone()
    }

    /// Push everything fresh to one worker: provider environment + config,
    /// a git-host token (throttled), and a newly minted control-plane token.
    pub async fn refresh_on_worker(
        &self,
        user: UserId,
        agent: AgentId,
        target: &WorkerTarget,
    ) -> Result<RefreshOutcome> {
        let credentials = self
            .provider
            .get_active_credentials(user)
            .await
            .context("loading active credentials")?;

        let oauth_token = match &credentials.auth {
            AuthMethod::OauthSubscription => self.fresh_oauth_token(user).await?,
            _ => None,
        };

        let environment = build_environment(&credentials.auth, oauth_token.as_ref());
        self.worker
            .update_credentials(
                target,
                &CredentialsPayload { environment, provider_config: credentials.config.clone() },
                STATE_TIMEOUT,
            )
            .await
            .context("pushing provider credentials")?;

        let mut outcome = RefreshOutcome::default();
        if self.github_refresh_due(agent) {
            outcome = self.refresh_github_token(user, agent, target).await?;
        }

        let token = self.minter.mint(user, agent).context("minting control-plane token")?;
        self.worker
            .update_ariana_token(target, &token, STATE_TIMEOUT)
            .await
            .context("pushing control-plane token")?;

        Ok(outcome)
    }

    /// Drop throttle entries for agents no longer in the running set.
    /// Called from the controller's sweeper.
    pub fn prune(&self, alive: &dyn Fn(AgentId) -> bool) {
        self.last_github_refresh.retain(|agent_id, _| alive(*agent_id));
    }

    async fn fresh_oauth_token(&self, user: UserId) -> Result<Option<OAuthToken>> {
        let token = self.provider.get_valid_oauth_token(user).await?;
        match token {
            Some(token) if token.is_fresh(Utc::now()) => Ok(Some(token)),
            Some(_) => {
                debug!(%user, "oauth token inside freshness window, refreshing");
                self.provider.refresh_oauth_token(user).await
            }
            None => Ok(None),
        }
    }

    fn github_refresh_due(&self, agent: AgentId) -> bool {
        match self.last_github_refresh.get(&agent) {
            Some(at) => at.elapsed() >= GITHUB_REFRESH_INTERVAL,
            None => true,
        }
    }

    async fn refresh_github_token(
        &self,
        user: UserId,
        agent: AgentId,
        target: &WorkerTarget,
    ) -> Result<RefreshOutcome> {
        self.last_github_refresh.insert(agent, Instant::now());
        match self.git_host.refresh_token(user).await? {
            Some(token) => {
                self.worker
                    .update_github_token(target, token.expose_secret(), STATE_TIMEOUT)
                    .await
                    .context("pushing git-host token")?;
                Ok(RefreshOutcome { github_refreshed: true, reauth_required: false })
            }
            None => {
                warn!(%user, %agent, "git-host grant revoked, re-auth required");
                Ok(RefreshOutcome { github_refreshed: false, reauth_required: true })
            }
        }
    }
}

impl std::fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialService")
            .field("throttled_agents", &self.last_github_refresh.len())
            .finish_non_exhaustive()
    }
}
