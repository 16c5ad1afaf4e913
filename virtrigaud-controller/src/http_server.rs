//! Health endpoint for the container scheduler's probes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::manager::ControllerManager;

#[derive(Clone)]
struct AppState {
    manager: Arc<ControllerManager>,
}

/// Serve `/healthz` and `/readyz` on the given address.
pub async fn run(listen: &str, manager: Arc<ControllerManager>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { manager });

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen, "health endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let depths = state.manager.queue_depths();
    let queues: serde_json::Map<String, serde_json::Value> = depths
        .into_iter()
        .map(|(kind, depth)| (kind.to_string(), json!(depth)))
        .collect();
    (StatusCode::OK, Json(json!({ "status": "ready", "queues": queues })))
}
