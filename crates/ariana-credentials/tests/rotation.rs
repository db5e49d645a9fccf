//! Credential rotation against a mock worker and collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use secrecy::Secret;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ariana_auth::TokenMinter;
use ariana_credentials::{
    ActiveCredentials, AuthMethod, CredentialProvider, CredentialService, GitHostClient,
    OAuthToken, PullRequestInfo,
};
use ariana_types::{AgentId, PullRequestState, UserId};
use ariana_worker_client::{WorkerClient, WorkerTarget};

struct StaticProvider;

#[async_trait]
impl CredentialProvider for StaticProvider {
    async fn get_active_credentials(&self, _user: UserId) -> Result<ActiveCredentials> {
        Ok(ActiveCredentials {
            auth: AuthMethod::AnthropicApiKey { key: Secret::new("sk-ant-test".into()) },
            config: serde_json::json!({ "provider": "anthropic" }),
        })
    }

    async fn get_valid_oauth_token(&self, _user: UserId) -> Result<Option<OAuthToken>> {
        Ok(None)
    }

    async fn refresh_oauth_token(&self, _user: UserId) -> Result<Option<OAuthToken>> {
        Ok(None)
    }
}

struct CountingGitHost {
    refreshes: AtomicUsize,
    token: Option<&'static str>,
}

#[async_trait]
impl GitHostClient for CountingGitHost {
    async fn get_valid_token(&self, _user: UserId) -> Result<Option<Secret<String>>> {
        Ok(self.token.map(|t| Secret::new(t.to_string())))
    }

    async fn refresh_token(&self, _user: UserId) -> Result<Option<Secret<String>>> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.token.map(|t| Secret::new(t.to_string())))
    }

    async fn get_pull_request_state(
        &self,
        _repo: &str,
        _pr_number: i64,
    ) -> Result<PullRequestState> {
        Ok(PullRequestState::Open)
    }

    async fn find_latest_pr_for_branch(
        &self,
        _repo: &str,
        _branch: &str,
    ) -> Result<Option<PullRequestInfo>> {
        Ok(None)
    }

    async fn get_default_branch(&self, _repo: &str) -> Result<String> {
        Ok("main".to_string())
    }
}

async fn mock_worker() -> MockServer {
    let server = MockServer::start().await;
    for endpoint in ["/update-credentials", "/update-github-token", "/update-ariana-token"] {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
            })))
            .mount(&server)
            .await;
    }
    server
}

fn service(git_host: Arc<CountingGitHost>) -> CredentialService {
    CredentialService::new(
        Arc::new(StaticProvider),
        git_host,
        TokenMinter::new(Secret::new("plane-secret".into())),
        WorkerClient::new(),
    )
}

#[tokio::test]
async fn refresh_pushes_all_three_credential_kinds() {
    let server = mock_worker().await;
    let git_host = Arc::new(CountingGitHost { refreshes: AtomicUsize::new(0), token: Some("ghs_1") });
    let service = service(git_host.clone());
    let target = WorkerTarget::new(&server.uri(), "key").unwrap();

    let outcome = service
        .refresh_on_worker(UserId::new(), AgentId::new(), &target)
        .await
        .unwrap();
    assert!(outcome.github_refreshed);
    assert!(!outcome.reauth_required);

    let received: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert!(received.contains(&"/update-credentials".to_string()));
    assert!(received.contains(&"/update-github-token".to_string()));
    assert!(received.contains(&"/update-ariana-token".to_string()));
}

#[tokio::test]
async fn github_refresh_is_throttled_per_agent() {
    let server = mock_worker().await;
    let git_host = Arc::new(CountingGitHost { refreshes: AtomicUsize::new(0), token: Some("ghs_1") });
    let service = service(git_host.clone());
    let target = WorkerTarget::new(&server.uri(), "key").unwrap();
    let user = UserId::new();
    let agent = AgentId::new();

    let first = service.refresh_on_worker(user, agent, &target).await.unwrap();
    let second = service.refresh_on_worker(user, agent, &target).await.unwrap();
    assert!(first.github_refreshed);
    assert!(!second.github_refreshed);
    assert_eq!(git_host.refreshes.load(Ordering::SeqCst), 1);

    // A different agent has its own throttle window.
    let third = service.refresh_on_worker(user, AgentId::new(), &target).await.unwrap();
    assert!(third.github_refreshed);
}

#[tokio::test]
async fn revoked_grant_reports_reauth_required() {
    let server = mock_worker().await;
    let git_host = Arc::new(CountingGitHost { refreshes: AtomicUsize::new(0), token: None });
    let service = service(git_host);
    let target = WorkerTarget::new(&server.uri(), "key").unwrap();

    let outcome = service
        .refresh_on_worker(UserId::new(), AgentId::new(), &target)
        .await
        .unwrap();
    assert!(outcome.reauth_required);
    assert!(!outcome.github_refreshed);

    // No github token was pushed.
    let pushed_github = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .any(|r| r.url.path() == "/update-github-token");
    assert!(!pushed_github);
}
