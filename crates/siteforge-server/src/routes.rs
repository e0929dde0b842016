//! HTTP API routes
//!
//! Generation and modification requests respond with an SSE stream of
//! pipeline progress; a second client can attach to the same run via
//! the run-events endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde::Deserialize;
use siteforge::pipeline::PipelineRequest;
use siteforge::ForgeError;
use tracing::info;
use uuid::Uuid;

use crate::state::AppState;
use crate::streamer::{stream_events, stream_run};

pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/modify", post(modify))
        .route("/runs/{build_id}/events", get(run_events))
        .route("/projects/{id}", get(get_project))
        .route("/sessions/{id}/context", get(get_session_context))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub build_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ForgeError> {
    start_run(state, body, false).await
}

async fn modify(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ForgeError> {
    start_run(state, body, true).await
}

/// Register a run, spawn the pipeline, and stream its events back
async fn start_run(
    state: Arc<AppState>,
    body: GenerateBody,
    is_modification: bool,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ForgeError> {
    let prompt = body.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ForgeError::Validation("prompt must not be empty".to_string()));
    }

    let session_id = body
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let build_id = body
        .build_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        session_id = %session_id,
        build_id = %build_id,
        is_modification,
        "Pipeline run requested"
    );

    let tx = state.runs.register(&build_id).await;
    let rx = tx.subscribe();

    let request = PipelineRequest {
        session_id: session_id.clone(),
        build_id: build_id.clone(),
        prompt,
        user_id: body.user_id,
        project_id: body.project_id,
        is_modification,
    };

    let orchestrator = state.orchestrator.clone();
    let runs = state.runs.clone();
    {
        let build_id = build_id.clone();
        tokio::spawn(async move {
            orchestrator.run(request, tx).await;
            runs.finish(&build_id).await;
        });
    }

    let intro = serde_json::json!({
        "session_id": session_id,
        "build_id": build_id,
        "is_modification": is_modification,
    });
    Ok(stream_events(rx, Some(intro)))
}

/// Attach to an in-flight run's event stream
async fn run_events(
    State(state): State<Arc<AppState>>,
    Path(build_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    stream_run(build_id, state.runs.clone()).await
}

async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<siteforge::models::ProjectRecord>, ForgeError> {
    let project = state
        .stores
        .projects
        .get(&id)
        .await?
        .ok_or(ForgeError::ProjectNotFound(id))?;
    Ok(Json(project))
}

/// Assembled conversation context for a session, as the generation
/// engine would see it
async fn get_session_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ForgeError> {
    let context = state.assembler.get_context(&id).await?;
    Ok(Json(serde_json::json!({
        "session_id": id,
        "context": context,
    })))
}
