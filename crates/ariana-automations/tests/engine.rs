//! Hook engine behavior against storage and a mock worker.

use chrono::Utc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ariana_automations::{AutomationEngine, TriggerEvent};
use ariana_storage::Storage;
use ariana_types::{
    Agent, Automation, AutomationId, AutomationTrigger, MachineType, ProjectId, ScriptLanguage,
    TriggerType, UserId,
};
use ariana_worker_client::{WorkerClient, WorkerTarget};

fn agent(project_id: ProjectId) -> Agent {
    Agent::provisioning(
        UserId::new(),
        project_id,
        "tester".into(),
        "ariana/tester".into(),
        "acme/website".into(),
        MachineType::Pool,
        12,
    )
}

fn automation(project_id: ProjectId, trigger: TriggerType, blocking: bool) -> Automation {
    Automation {
        id: AutomationId::new(),
        project_id,
        user_id: UserId::new(),
        name: "pre-commit-lint".into(),
        trigger: AutomationTrigger {
            trigger_type: trigger,
            file_glob: None,
            command_regex: None,
            automation_id: None,
        },
        script_language: ScriptLanguage::Bash,
        script_content: "cargo clippy".into(),
        blocking,
        feed_output: false,
    }
}

/// Worker that accepts exactly the given ids.
async fn worker_accepting(ids: &[AutomationId]) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/execute-automations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "executedIds": ids,
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn blocking_subset_follows_worker_accepted_ids() {
    let storage = Storage::in_memory().await.unwrap();
    let project = ProjectId::new();
    let agent = agent(project);

    let accepted = automation(project, TriggerType::OnBeforeCommit, true);
    let declined = automation(project, TriggerType::OnBeforeCommit, true);
    storage.automations().insert(&accepted).await.unwrap();
    storage.automations().insert(&declined).await.unwrap();

    // The worker only starts one of the two blocking automations; only that
    // one is waited on.
    let server = worker_accepting(&[accepted.id]).await;
    let engine = AutomationEngine::new(storage, WorkerClient::new());
    let target = WorkerTarget::new(&server.uri(), "k").unwrap();

    let outcome = engine
        .fire(&agent, &target, &TriggerEvent::lifecycle(TriggerType::OnBeforeCommit))
        .await
        .unwrap();
    assert_eq!(outcome.executed, vec![accepted.id]);
    assert_eq!(outcome.blocking, vec![accepted.id]);
    assert!(outcome.has_blocking());
}

#[tokio::test]
async fn running_automation_is_not_restarted() {
    let storage = Storage::in_memory().await.unwrap();
    let project = ProjectId::new();
    let agent = agent(project);

    let a = automation(project, TriggerType::OnAgentReady, false);
    storage.automations().insert(&a).await.unwrap();
    storage
        .automation_events()
        .insert_running(a.id, agent.id, "", Utc::now())
        .await
        .unwrap();

    let server = worker_accepting(&[]).await;
    let engine = AutomationEngine::new(storage, WorkerClient::new());
    let target = WorkerTarget::new(&server.uri(), "k").unwrap();

    let outcome = engine
        .fire(&agent, &target, &TriggerEvent::lifecycle(TriggerType::OnAgentReady))
        .await
        .unwrap();
    assert!(outcome.executed.is_empty());
    // Everything deduplicated: the worker was never called.
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn before_commit_dedups_runs_since_last_commit() {
    let storage = Storage::in_memory().await.unwrap();
    let project = ProjectId::new();
    let mut agent = agent(project);
    agent.last_commit_at = Some(Utc::now() - chrono::Duration::minutes(10));

    let a = automation(project, TriggerType::OnBeforeCommit, true);
    storage.automations().insert(&a).await.unwrap();

    // Ran five minutes ago, after the last commit: skip.
    let id = storage
        .automation_events()
        .insert_running(a.id, agent.id, "", Utc::now() - chrono::Duration::minutes(5))
        .await
        .unwrap();
    storage
        .automation_events()
        .complete(id, ariana_types::AutomationEventStatus::Finished, "ok", Some(0), Utc::now())
        .await
        .unwrap();

    let server = worker_accepting(&[a.id]).await;
    let engine = AutomationEngine::new(storage.clone(), WorkerClient::new());
    let target = WorkerTarget::new(&server.uri(), "k").unwrap();

    let outcome = engine
        .fire(&agent, &target, &TriggerEvent::lifecycle(TriggerType::OnBeforeCommit))
        .await
        .unwrap();
    assert!(outcome.executed.is_empty());

    // After a fresh commit, the same automation is eligible again.
    agent.last_commit_at = Some(Utc::now());
    let outcome = engine
        .fire(&agent, &target, &TriggerEvent::lifecycle(TriggerType::OnBeforeCommit))
        .await
        .unwrap();
    assert_eq!(outcome.executed, vec![a.id]);
}
