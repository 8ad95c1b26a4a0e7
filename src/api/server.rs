use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::operator::{completion_handler, operator_action_handler};
use crate::api::runs::{get_run_handler, list_runs_handler, start_run_handler};
use crate::pipeline::service::CoordinatorService;

#[derive(Clone)]
pub struct AppState {
    pub service_name: &'static str,
    pub service_version: &'static str,
    pub started_unix_ms: u128,
    pub service: CoordinatorService,
}

impl AppState {
    pub fn new(service: CoordinatorService) -> Self {
        Self {
            service_name: "nowcast-coordinator",
            service_version: env!("CARGO_PKG_VERSION"),
            started_unix_ms: now_unix_ms(),
            service,
        }
    }
}

pub fn build_router(service: CoordinatorService) -> Router {
    let state = AppState::new(service);
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/runs", get(list_runs_handler))
        .route("/api/runs/{runType}/{date}", get(get_run_handler))
        .route("/api/runs/{runType}/{date}/start", post(start_run_handler))
        .route(
            "/api/runs/{runType}/{date}/stages/{stageKey}/{action}",
            post(operator_action_handler),
        )
        .route("/api/events/completions", post(completion_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, service: CoordinatorService) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(service);
    info!(bind = %addr, "starting nowcast-coordinator HTTP surface");
    axum::serve(listener, app).await
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let catalog = state.service.coordinator().catalog();
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "status": "ok",
            "service": state.service_name,
            "version": state.service_version,
            "started_unix_ms": state.started_unix_ms,
            "run_types": catalog.run_types(),
            "stage_count": catalog.stages().len(),
            "catalog_digest": catalog.digest(),
        })),
    )
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
