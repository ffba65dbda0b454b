//! HTTP serving layer. Reads only from the catalog and the status snapshot;
//! sync requests are handed to the service and never run inline.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::service::{SyncService, TriggerOutcome};

#[derive(Clone)]
pub struct AppState {
    pub service: SyncService,
    /// Kick off a background cycle whenever the catalog is requested.
    pub sync_on_catalog_request: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/vehicles", get(vehicles))
        .route("/api/sync", post(trigger_sync))
        .route("/api/sync/status", get(sync_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /api/vehicles
async fn vehicles(State(state): State<AppState>) -> Response {
    if state.sync_on_catalog_request {
        let _ = state.service.trigger_sync();
    }
    let snapshot = state.service.catalog().snapshot();
    Json(snapshot.records.records.clone()).into_response()
}

/// POST /api/sync
async fn trigger_sync(State(state): State<AppState>) -> Response {
    match state.service.trigger_sync() {
        TriggerOutcome::Accepted { run_id } => (
            StatusCode::ACCEPTED,
            Json(json!({ "accepted": true, "run_id": run_id })),
        )
            .into_response(),
        TriggerOutcome::AlreadyRunning => (
            StatusCode::CONFLICT,
            Json(json!({ "accepted": false, "reason": "already running" })),
        )
            .into_response(),
    }
}

/// GET /api/sync/status
async fn sync_status(State(state): State<AppState>) -> Response {
    Json(state.service.status()).into_response()
}
