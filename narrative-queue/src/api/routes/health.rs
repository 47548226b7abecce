//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;

use crate::api::routes::providers::ProviderStatus;
use crate::api::server::AppState;
use crate::database::repositories::EntryQuery;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/health/ready", get(readiness_check))
        .route("/api/health/live", get(liveness_check))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub providers: Vec<ProviderStatus>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if store_reachable(&state).await {
        "healthy"
    } else {
        "degraded"
    };

    let providers = state
        .dispatcher
        .providers()
        .into_iter()
        .map(|provider| ProviderStatus {
            provider,
            running: state.dispatcher.is_running(provider),
        })
        .collect();

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        providers,
    })
}

/// 200 when the store answers a query, 503 otherwise.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if store_reachable(&state).await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptimeSecs": uptime
        })),
    )
}

async fn store_reachable(state: &AppState) -> bool {
    let probe = EntryQuery {
        limit: Some(1),
        ..Default::default()
    };
    match state.queue.queue().get_entries(&probe).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("Health probe failed: {}", e);
            false
        }
    }
}
