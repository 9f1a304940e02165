//! HTTP trigger API.
//!
//! `POST /generate` only enqueues; progress is read back from `/runs/:id`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use kiln_core::{
    new_session_id, CoreError, Dispatcher, GenerationRequest, RunRecord, SessionInfo, SessionStore,
    DEFAULT_TEMPLATE, RUN_RETENTION,
};

/// How often stale sessions and finished runs are swept.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub sessions: Arc<SessionStore>,
    /// How long finished run records stay queryable
    pub run_retention: Duration,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, sessions: Arc<SessionStore>) -> Self {
        Self {
            dispatcher,
            sessions,
            run_retention: RUN_RETENTION,
        }
    }

    pub fn with_run_retention(mut self, retention: Duration) -> Self {
        self.run_retention = retention;
        self
    }
}

/// One eviction pass: expired sessions, then finished runs past retention.
pub async fn sweep(state: &AppState) {
    let sessions = state.sessions.evict_expired().await;
    let runs = state.dispatcher.tracker().evict_finished(state.run_retention);
    if sessions > 0 || runs > 0 {
        info!("Evicted {} expired session(s) and {} finished run(s)", sessions, runs);
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    template_id: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccepted {
    status: &'static str,
    session_id: String,
    message: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Routes of the trigger API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/runs/:session_id", get(get_run))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", delete(delete_session))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `port` until the listener fails.
pub async fn run_server(port: u16, state: AppState) -> Result<()> {
    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut ticker = interval(EVICTION_INTERVAL);
        loop {
            ticker.tick().await;
            sweep(&sweeper).await;
        }
    });

    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("HTTP server stopped")?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn generate(
    State(state): State<AppState>,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let prompt = match body.prompt {
        Some(prompt) if !prompt.trim().is_empty() => prompt,
        _ => return error_response(StatusCode::BAD_REQUEST, "prompt is required"),
    };

    let mut request = GenerationRequest::new(prompt)
        .with_session_id(body.session_id.unwrap_or_else(new_session_id))
        .with_template(body.template_id.unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()));
    if let Some(port) = body.port {
        request = request.with_port(port);
    }

    if let Err(e) = request.validate() {
        let message = match e {
            CoreError::InvalidRequest(message) => message,
            other => other.to_string(),
        };
        return error_response(StatusCode::BAD_REQUEST, message);
    }

    let session_id = request.session_id.clone();
    if let Err(e) = state.dispatcher.submit(request.into()).await {
        warn!("Could not enqueue run for session {}: {}", session_id, e);
        return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
    }
    info!("Enqueued generation for session {}", session_id);

    Json(GenerateAccepted {
        status: "started",
        message: format!("Generation started. Poll /runs/{} for progress.", session_id),
        session_id,
    })
    .into_response()
}

async fn get_run(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<RunRecord>, (StatusCode, String)> {
    state
        .dispatcher
        .tracker()
        .get(&session_id)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("No run for session {}", session_id)))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.sessions())
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.sessions.destroy(&id).await {
        info!("Deleted session {}", id);
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
