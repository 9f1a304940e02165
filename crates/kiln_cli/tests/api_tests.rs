//! HTTP trigger API tests, driven through the router without a socket.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use kiln_agent::ScriptedAgent;
use kiln_cli::server::{build_router, sweep, AppState};
use kiln_core::{
    Dispatcher, RetryPolicy, ServerLauncher, SessionStore, TemplateRegistry, WorkflowOrchestrator,
};
use kiln_sandbox::{MockResponse, MockSandboxProvider};

fn app(provider: &MockSandboxProvider, agent: &ScriptedAgent) -> Router {
    build_router(state(provider, agent))
}

fn state(provider: &MockSandboxProvider, agent: &ScriptedAgent) -> AppState {
    let orchestrator = Arc::new(
        WorkflowOrchestrator::new(
            Arc::new(SessionStore::new(Arc::new(provider.clone()))),
            Arc::new(agent.clone()),
            Arc::new(TemplateRegistry::builtin()),
            Arc::new(ServerLauncher::new()),
        )
        .with_retry_policy(RetryPolicy::none()),
    );
    let sessions = orchestrator.sessions().clone();
    let (dispatcher, _handle) = Dispatcher::spawn(orchestrator, 8);
    AppState::new(dispatcher, sessions)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn wait_for_run(app: &Router, session_id: &str) -> Value {
    for _ in 0..200 {
        let (status, body) = send(app, get(&format!("/runs/{}", session_id))).await;
        if status == StatusCode::OK {
            let record: Value = serde_json::from_slice(&body).unwrap();
            if record["status"] == "completed" || record["status"] == "failed" {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run for {} did not finish", session_id);
}

#[tokio::test]
async fn test_health() {
    let app = app(&MockSandboxProvider::new(), &ScriptedAgent::new());

    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");
}

#[tokio::test]
async fn test_generate_requires_prompt() {
    let agent = ScriptedAgent::new();
    let app = app(&MockSandboxProvider::new(), &agent);

    for body in [json!({}), json!({ "prompt": "" }), json!({ "sessionId": "s1" })] {
        let (status, body) = send(&app, post_json("/generate", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, json!({ "error": "prompt is required" }));
    }
    assert_eq!(agent.call_count(), 0);
}

#[tokio::test]
async fn test_generate_rejects_port_zero() {
    let app = app(&MockSandboxProvider::new(), &ScriptedAgent::new());

    let (status, body) = send(
        &app,
        post_json("/generate", json!({ "prompt": "build", "port": 0 })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"], "port must be positive");
}

#[tokio::test]
async fn test_generate_enqueues_and_runs() {
    let provider = MockSandboxProvider::new().add_response(MockResponse::success("ready"));
    let agent = ScriptedAgent::new();
    let app = app(&provider, &agent);

    let (status, body) = send(
        &app,
        post_json(
            "/generate",
            json!({ "prompt": "build a todo app", "sessionId": "abc" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let accepted: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(accepted["status"], "started");
    assert_eq!(accepted["sessionId"], "abc");
    assert_eq!(
        accepted["message"],
        "Generation started. Poll /runs/abc for progress."
    );
    assert!(accepted.get("result").is_none());

    let record = wait_for_run(&app, "abc").await;
    assert_eq!(record["status"], "completed");
    assert_eq!(record["result"]["success"], true);
    assert_eq!(record["result"]["attempts"], 1);
    assert_eq!(
        record["result"]["previewUrl"],
        "https://mock-sb-1.sandbox.test:3000"
    );
    assert_eq!(agent.prompts(), vec!["build a todo app".to_string()]);
}

#[tokio::test]
async fn test_generate_assigns_session_id() {
    let provider = MockSandboxProvider::new().add_response(MockResponse::success("ready"));
    let app = app(&provider, &ScriptedAgent::new());

    let (status, body) = send(&app, post_json("/generate", json!({ "prompt": "build" }))).await;

    assert_eq!(status, StatusCode::OK);
    let accepted: Value = serde_json::from_slice(&body).unwrap();
    let session_id = accepted["sessionId"].as_str().unwrap().to_string();
    assert!(!session_id.is_empty());

    let record = wait_for_run(&app, &session_id).await;
    assert_eq!(record["result"]["templateId"], "nextjs-developer");
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let app = app(&MockSandboxProvider::new(), &ScriptedAgent::new());

    let (status, _) = send(&app, get("/runs/nobody")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sessions_listing_and_delete() {
    let provider = MockSandboxProvider::new().add_response(MockResponse::success("ready"));
    let app = app(&provider, &ScriptedAgent::new());

    send(
        &app,
        post_json("/generate", json!({ "prompt": "build", "sessionId": "s1" })),
    )
    .await;
    wait_for_run(&app, "s1").await;

    let (status, body) = send(&app, get("/sessions")).await;
    assert_eq!(status, StatusCode::OK);
    let sessions: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(sessions.as_array().unwrap().len(), 1);
    assert_eq!(sessions[0]["sessionId"], "s1");
    assert_eq!(sessions[0]["sandboxId"], "mock-sb-1");

    let delete = Request::builder()
        .method("DELETE")
        .uri("/sessions/s1")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(provider.killed_count(), 1);

    let delete = Request::builder()
        .method("DELETE")
        .uri("/sessions/s1")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, delete).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_body_gets_json_error() {
    let app = app(&MockSandboxProvider::new(), &ScriptedAgent::new());

    for body in [json!({ "prompt": 123 }), json!({ "prompt": "build", "port": 70000 })] {
        let (status, body) = send(&app, post_json("/generate", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert!(value["error"].is_string());
    }

    let no_content_type = Request::builder()
        .method("POST")
        .uri("/generate")
        .body(Body::from(r#"{"prompt":"build"}"#))
        .unwrap();
    let (status, body) = send(&app, no_content_type).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert!(value["error"].is_string());
}

#[tokio::test]
async fn test_omitted_port_defaults_to_3000() {
    let provider = MockSandboxProvider::new().add_response(MockResponse::success("ready"));
    let app = app(&provider, &ScriptedAgent::new());

    send(
        &app,
        post_json(
            "/generate",
            json!({ "prompt": "a dashboard", "sessionId": "st", "templateId": "streamlit-developer" }),
        ),
    )
    .await;

    let record = wait_for_run(&app, "st").await;
    assert_eq!(
        record["result"]["previewUrl"],
        "https://mock-sb-1.sandbox.test:3000"
    );
}

#[tokio::test]
async fn test_sweep_drops_finished_runs() {
    let provider = MockSandboxProvider::new().add_response(MockResponse::success("ready"));
    let state = state(&provider, &ScriptedAgent::new()).with_run_retention(Duration::ZERO);
    let app = build_router(state.clone());

    send(
        &app,
        post_json("/generate", json!({ "prompt": "build", "sessionId": "old" })),
    )
    .await;
    wait_for_run(&app, "old").await;
    assert_eq!(state.dispatcher.tracker().len(), 1);

    sweep(&state).await;

    assert!(state.dispatcher.tracker().is_empty());
    let (status, _) = send(&app, get("/runs/old")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
