//! Siteforge server
//!
//! HTTP front end for the generation pipeline: accepts generation and
//! modification requests, streams pipeline progress over SSE, and
//! exposes project and session lookups.

mod config;
mod routes;
mod runs;
mod state;
mod streamer;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "siteforge_server=info,siteforge=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Starting siteforge server on {}:{}", config.host, config.port);

    let addr = SocketAddr::new(config.host.parse()?, config.port);

    // Create app state (connects to the store backend)
    let state = AppState::from_config(config).await?;

    // Build router
    let app = build_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let public_routes = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .with_state(state.clone());

    Router::new()
        .merge(public_routes)
        .nest("/api", routes::api_router(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn root() -> &'static str {
    "Siteforge Server"
}

async fn health_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let database = match &state.db {
        Some(db) => match db.ping().await {
            Ok(()) => "connected",
            Err(_) => return Err(StatusCode::SERVICE_UNAVAILABLE),
        },
        None => "memory",
    };
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "database": database,
        "running_pipelines": state.runs.running_count().await,
        "version": env!("CARGO_PKG_VERSION")
    })))
}
