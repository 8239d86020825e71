use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum_test::TestServer;
use deep_researcher_api::config::AppConfig;
use deep_researcher_api::routes::build_router;
use deep_researcher_api::state::AppState;
use deep_researcher_core::{
    ConfigOverrides, ConfigResolver, InMemoryCheckpointStore, ResearchService, SessionManager,
    StubModel, Workflow,
};
use serde_json::{Value, json};
use tower::ServiceExt;

fn offline_state(config: &AppConfig) -> AppState {
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let service = ResearchService::new(
        SessionManager::in_memory(checkpoints.clone()),
        Workflow::new(Arc::new(StubModel::offline()), checkpoints),
        ConfigResolver::default(),
    )
    .with_env_layer(ConfigOverrides::default());
    AppState::new(service, config)
}

fn server(config: AppConfig) -> TestServer {
    TestServer::new(build_router(offline_state(&config))).unwrap()
}

fn start_body(message: &str) -> Value {
    json!({
        "message": message,
        "chatId": "chat-1",
        "configuration": {"allowClarification": false, "searchApi": "none"}
    })
}

fn ndjson(text: &str) -> Vec<Value> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("valid ndjson line"))
        .collect()
}

#[tokio::test]
async fn health_reports_capacity() {
    let response = build_router(offline_state(&AppConfig::default()))
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn research_routes_require_a_user_id() {
    let server = server(AppConfig::default());
    let response = server.get("/research/sessions").await;
    assert_eq!(response.status_code(), 401);
}

#[tokio::test]
async fn research_routes_require_bearer_token_when_configured() {
    let server = server(AppConfig {
        auth_token: Some("secret".into()),
        ..AppConfig::default()
    });

    let response = server
        .get("/research/sessions")
        .add_header("x-user-id", "user-1")
        .await;
    assert_eq!(response.status_code(), 401);

    let response = server
        .get("/research/sessions")
        .add_header("x-user-id", "user-1")
        .add_header("authorization", "Bearer secret")
        .await;
    assert_eq!(response.status_code(), 200);
    let body = response.json::<Value>();
    assert!(body["sessions"].is_array());
}

#[tokio::test]
async fn start_streams_events_and_records_the_session() {
    let server = server(AppConfig::default());

    let response = server
        .post("/research/start")
        .add_header("x-user-id", "user-1")
        .json(&start_body("How are nurse salaries trending?"))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.header("x-resume-mode"), "new");
    let session_id = response
        .header("x-session-id")
        .to_str()
        .expect("ascii header")
        .to_string();
    assert!(!response.header("x-thread-id").is_empty());

    let events = ndjson(&response.text());
    assert_eq!(events.first().map(|event| event["type"].clone()), Some(json!("update")));
    let last = events.last().expect("events streamed");
    assert_eq!(last["type"], "final");
    assert!(last["finalReport"].as_str().is_some_and(|report| report.contains("[1]")));

    let session = server
        .get(&format!("/research/session/{session_id}"))
        .add_header("x-user-id", "user-1")
        .await;
    assert_eq!(session.status_code(), 200);
    let session = session.json::<Value>();
    assert_eq!(session["status"], "completed");
    assert!(session["researchBrief"].is_string());

    let other_user = server
        .get(&format!("/research/session/{session_id}"))
        .add_header("x-user-id", "user-2")
        .await;
    assert_eq!(other_user.status_code(), 404);
}

#[tokio::test]
async fn second_start_on_the_same_chat_resumes() {
    let server = server(AppConfig::default());
    let first = server
        .post("/research/start")
        .add_header("x-user-id", "user-1")
        .json(&start_body("Nurse retention"))
        .await;
    assert_eq!(first.status_code(), 200);

    let checkpoint = server
        .get("/research/checkpoint?chatId=chat-1")
        .add_header("x-user-id", "user-1")
        .await
        .json::<Value>();
    // Completed sessions are not resumable.
    assert_eq!(checkpoint["exists"], false);

    let replay = server
        .post("/research/start")
        .add_header("x-user-id", "user-1")
        .json(&json!({"chatId": "chat-1"}))
        .await;
    assert_eq!(replay.status_code(), 200);
    assert_eq!(replay.header("x-resume-mode"), "resume");
    assert_eq!(replay.header("x-thread-id"), first.header("x-thread-id"));
    let events = ndjson(&replay.text());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "final");
}

#[tokio::test]
async fn sessions_can_be_filtered_and_deleted() {
    let server = server(AppConfig::default());
    let started = server
        .post("/research/start")
        .add_header("x-user-id", "user-1")
        .json(&start_body("Nurse pay"))
        .await;
    let session_id = started
        .header("x-session-id")
        .to_str()
        .expect("ascii header")
        .to_string();

    let completed = server
        .get("/research/sessions?status=completed")
        .add_header("x-user-id", "user-1")
        .await
        .json::<Value>();
    assert_eq!(completed["sessions"].as_array().map(Vec::len), Some(1));

    let bad_filter = server
        .get("/research/sessions?status=sideways")
        .add_header("x-user-id", "user-1")
        .await;
    assert_eq!(bad_filter.status_code(), 400);

    let deleted = server
        .delete(&format!("/research/session/{session_id}"))
        .add_header("x-user-id", "user-1")
        .await;
    assert_eq!(deleted.status_code(), 204);

    let again = server
        .delete(&format!("/research/session/{session_id}"))
        .add_header("x-user-id", "user-1")
        .await;
    assert_eq!(again.status_code(), 404);
}

#[tokio::test]
async fn start_is_rejected_when_capacity_is_exhausted() {
    let config = AppConfig {
        max_concurrent_runs: 1,
        ..AppConfig::default()
    };
    let state = offline_state(&config);
    let held = state.acquire_run_permit().expect("first slot");
    let server = TestServer::new(build_router(state)).unwrap();

    let response = server
        .post("/research/start")
        .add_header("x-user-id", "user-1")
        .json(&start_body("Nurse pay"))
        .await;
    assert_eq!(response.status_code(), 429);
    drop(held);
}
