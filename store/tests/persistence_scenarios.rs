//! End-to-end scenarios against the public API, one `#[tokio::test]` per literal
//! scenario, each against its own in-memory database.
use orchestrator_store::{
    ApiKey, ComponentType, ExecutionType, RepositoryError, Store, StoreConfig, StatusType, TaskState, UsageEntry,
    UsageSummary, User, UserRole, WorkflowFilter, WorkflowState,
};
use uuid::Uuid;

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    });
}

async fn open_store() -> Store {
    init_tracing();
    Store::open(&StoreConfig::in_memory()).await.expect("open store")
}

#[tokio::test]
async fn scenario_1_upsert_then_get() {
    let store = open_store().await;
    let repos = orchestrator_store::Repositories::new(&store);

    let state = WorkflowState::new("wfx-1", "wf-1", StatusType::Running);
    repos.workflow.upsert_state(&state).await.unwrap();

    let fetched = repos.workflow.get_state("wfx-1").await.unwrap();
    assert_eq!(fetched.status, StatusType::Running);

    let tasks = repos.task.list_tasks_in_workflow("wfx-1").await.unwrap();
    assert!(tasks.is_empty());

    store.close().await;
}

#[tokio::test]
async fn scenario_2_listing_filter() {
    let store = open_store().await;
    let repos = orchestrator_store::Repositories::new(&store);

    repos
        .workflow
        .upsert_state(&WorkflowState::new("wfx-running", "wf-a", StatusType::Running))
        .await
        .unwrap();
    repos
        .workflow
        .upsert_state(&WorkflowState::new("wfx-success", "wf-b", StatusType::Success))
        .await
        .unwrap();

    let results = repos
        .workflow
        .list_states(&WorkflowFilter::new().with_status(StatusType::Success))
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].workflow_exec_id, "wfx-success");

    store.close().await;
}

#[tokio::test]
async fn scenario_3_completion_happy_path() {
    let store = open_store().await;
    let repos = orchestrator_store::Repositories::new(&store);

    repos
        .workflow
        .upsert_state(&WorkflowState::new("wfx-2", "wf-2", StatusType::Running))
        .await
        .unwrap();

    let mut task = TaskState::new(
        Uuid::new_v4().to_string(),
        ComponentType::Task,
        StatusType::Success,
        "t1",
        "wfx-2",
        "wf-2",
        ExecutionType::Basic,
    );
    task.output = Some(serde_json::json!({ "value": 1 }));
    repos.task.upsert_state(&task).await.unwrap();

    let completed = repos.workflow.complete_workflow("wfx-2", None, 100, 10).await.unwrap();

    assert_eq!(completed.status, StatusType::Success);
    assert_eq!(
        completed.output.unwrap(),
        serde_json::json!({ "t1": { "output": { "value": 1 } } })
    );

    store.close().await;
}

#[tokio::test]
async fn scenario_4_completion_transformer_error() {
    let store = open_store().await;
    let repos = orchestrator_store::Repositories::new(&store);

    repos
        .workflow
        .upsert_state(&WorkflowState::new("wfx-3", "wf-3", StatusType::Running))
        .await
        .unwrap();

    let mut task = TaskState::new(
        Uuid::new_v4().to_string(),
        ComponentType::Task,
        StatusType::Success,
        "t1",
        "wfx-3",
        "wf-3",
        ExecutionType::Basic,
    );
    task.output = Some(serde_json::json!({ "value": 1 }));
    repos.task.upsert_state(&task).await.unwrap();

    let transformer: orchestrator_store::OutputTransformer = Box::new(|_state, _tasks| Err("projection failed".into()));
    let completed = repos
        .workflow
        .complete_workflow("wfx-3", Some(&transformer), 100, 10)
        .await
        .unwrap();

    assert_eq!(completed.status, StatusType::Failed);
    let error = completed.error.unwrap();
    assert_eq!(error["code"], "OUTPUT_TRANSFORMATION_FAILED");
    assert_eq!(
        completed.output.unwrap(),
        serde_json::json!({ "t1": { "output": { "value": 1 } } })
    );

    store.close().await;
}

#[tokio::test]
async fn scenario_5_completion_not_ready() {
    let store = open_store().await;
    let repos = orchestrator_store::Repositories::new(&store);

    repos
        .workflow
        .upsert_state(&WorkflowState::new("wfx-4", "wf-4", StatusType::Running))
        .await
        .unwrap();

    let task = TaskState::new(
        Uuid::new_v4().to_string(),
        ComponentType::Task,
        StatusType::Running,
        "t1",
        "wfx-4",
        "wf-4",
        ExecutionType::Basic,
    );
    repos.task.upsert_state(&task).await.unwrap();

    let err = repos.workflow.complete_workflow("wfx-4", None, 100, 10).await.unwrap_err();
    assert!(matches!(err, RepositoryError::WorkflowNotReady(_)));

    let still_running = repos.workflow.get_state("wfx-4").await.unwrap();
    assert_eq!(still_running.status, StatusType::Running);

    store.close().await;
}

#[tokio::test]
async fn scenario_6_contended_usage_merge() {
    let store = open_store().await;
    let pool = store.pool().clone();
    let repo = std::sync::Arc::new(orchestrator_store::SqliteWorkflowRepository::new(pool));

    let state = WorkflowState::new("wfx-5", "wf-5", StatusType::Running);
    repo.upsert_state(&state).await.unwrap();
    repo.merge_usage(
        "wfx-5",
        &UsageSummary::single(UsageEntry::new("openai", "gpt-4", 5, 5)),
        50,
    )
    .await
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.merge_usage(
                "wfx-5",
                &UsageSummary::single(UsageEntry::new("openai", "gpt-4", 1, 1)),
                50,
            )
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let final_state = repo.get_state("wfx-5").await.unwrap();
    let usage = final_state.usage.unwrap();
    assert_eq!(usage.0.len(), 1);
    assert_eq!(usage.0[0].effective_total(), 16);

    store.close().await;
}

#[tokio::test]
async fn scenario_7_cascade_delete() {
    let store = open_store().await;
    let repos = orchestrator_store::Repositories::new(&store);

    let user = User {
        id: Uuid::new_v4().to_string(),
        email: "owner@example.com".to_string(),
        role: UserRole::User,
        created_at: chrono::Utc::now(),
        updated_at: None,
    };
    repos.auth.create_user(&user).await.unwrap();

    let key = ApiKey {
        id: Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        hash: orchestrator_store::secrets::hash("sk_live_abc").unwrap(),
        prefix: "sk_live".to_string(),
        fingerprint: orchestrator_store::secrets::fingerprint("sk_live_abc"),
        created_at: chrono::Utc::now(),
        last_used: None,
    };
    repos.auth.create_api_key(&key).await.unwrap();

    repos.auth.delete_user(&user.id).await.unwrap();

    let err = repos.auth.get_api_key_by_id(&key.id).await.unwrap_err();
    assert!(matches!(err, RepositoryError::ApiKeyNotFound(_)));

    store.close().await;
}

#[tokio::test]
async fn scenario_8_bootstrap_race() {
    let store = open_store().await;
    let pool = store.pool().clone();
    let repo = std::sync::Arc::new(orchestrator_store::SqliteAuthRepository::new(pool));

    let mut handles = Vec::new();
    for i in 0..2 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            let admin = User {
                id: Uuid::new_v4().to_string(),
                email: format!("admin{i}@example.com"),
                role: UserRole::Admin,
                created_at: chrono::Utc::now(),
                updated_at: None,
            };
            repo.create_initial_admin_if_none(&admin).await
        }));
    }

    let mut successes = 0;
    let mut already_bootstrapped = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(RepositoryError::AlreadyBootstrapped) => already_bootstrapped += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(already_bootstrapped, 1);

    store.close().await;
}
