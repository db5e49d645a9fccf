//! Worker RPC transport behavior against a mock daemon.

use std::time::Duration;

use wiremock::matchers::{body_json_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ariana_types::wire::{PromptRequest, StartSetup};
use ariana_types::ModelKind;
use ariana_worker_client::{WorkerClient, WorkerClientError, WorkerTarget, POLL_TIMEOUT};

fn target_for(server: &MockServer) -> WorkerTarget {
    WorkerTarget::new(&server.uri(), "shared-secret").unwrap()
}

#[tokio::test]
async fn claude_state_sends_shared_secret() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/claude-state"))
        .and(header("authorization", "Bearer shared-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "isReady": true,
            "hasBlockingAutomation": false,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = WorkerClient::new();
    let state = client.claude_state(&target_for(&server), POLL_TIMEOUT).await.unwrap();
    assert!(state.is_ready);
    assert!(!state.has_blocking_automation);
}

#[tokio::test]
async fn prompt_dispatch_posts_model_and_task_id() {
    let server = MockServer::start().await;
    let expected = serde_json::json!({
        "prompt": "write a README",
        "model": "sonnet",
        "taskId": "task-1",
    });
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .and(body_json_string(expected.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = WorkerClient::new();
    let request = PromptRequest {
        prompt: "write a README".into(),
        model: ModelKind::Sonnet,
        task_id: "task-1".into(),
    };
    client
        .prompt(&target_for(&server), &request, Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test]
async fn semantic_failure_is_not_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/git-push"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false,
            "error": "remote rejected: protected branch",
        })))
        .mount(&server)
        .await;

    let client = WorkerClient::new();
    let err = client
        .git_push(&target_for(&server), Duration::from_secs(5))
        .await
        .unwrap_err();
    match &err {
        WorkerClientError::Semantic { message, .. } => {
            assert!(message.contains("protected branch"));
        }
        other => panic!("expected semantic failure, got {other:?}"),
    }
    assert!(!err.is_transient());
}

#[tokio::test]
async fn not_initialized_marker_is_detected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/interrupt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false,
            "error": "agent process not initialized",
        })))
        .mount(&server)
        .await;

    let client = WorkerClient::new();
    let err = client
        .interrupt(&target_for(&server), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerClientError::NotInitialized { .. }));
}

#[tokio::test]
async fn slow_worker_hits_the_per_call_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/conversations"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "messages": [] }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let client = WorkerClient::new();
    let err = client
        .conversations(&target_for(&server), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerClientError::Timeout { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn connection_refused_is_transient() {
    // Nothing listens on this port.
    let target = WorkerTarget::new("127.0.0.1:1", "k").unwrap();
    let client = WorkerClient::new();
    let err = client.claude_state(&target, Duration::from_secs(1)).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn health_wait_retries_until_healthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
        .mount(&server)
        .await;

    let client = WorkerClient::new();
    client.wait_healthy(&target_for(&server)).await.unwrap();
}

#[tokio::test]
async fn start_setup_is_mode_tagged_on_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/start"))
        .and(body_json_string(
            serde_json::json!({
                "mode": "cloneWithToken",
                "repoUrl": "https://github.com/a/b.git",
                "token": "ghs_123",
                "baseBranch": "main",
            })
            .to_string(),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = WorkerClient::new();
    let setup = StartSetup::CloneWithToken {
        repo_url: "https://github.com/a/b.git".into(),
        token: "ghs_123".into(),
        base_branch: Some("main".into()),
    };
    client
        .start(&target_for(&server), &setup, Duration::from_secs(30))
        .await
        .unwrap();
}
