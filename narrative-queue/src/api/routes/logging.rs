//! Logging API routes.
//!
//! View and change the live log filter.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::require_admin;
use crate::api::server::AppState;
use crate::logging::LoggingHandle;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/logging", get(get_logging_config).put(update_logging_config))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfigResponse {
    pub filter: String,
    pub log_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLogFilterRequest {
    /// e.g. `"narrative_queue=debug,sqlx=warn"`
    pub filter: String,
}

fn handle(state: &AppState) -> ApiResult<&Arc<LoggingHandle>> {
    state
        .logging
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("logging is not managed by this process"))
}

fn describe(logging: &LoggingHandle) -> LoggingConfigResponse {
    LoggingConfigResponse {
        filter: logging.get_filter(),
        log_dir: logging.log_dir().map(|p| p.display().to_string()),
    }
}

async fn get_logging_config(State(state): State<AppState>) -> ApiResult<Json<LoggingConfigResponse>> {
    Ok(Json(describe(handle(&state)?)))
}

async fn update_logging_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UpdateLogFilterRequest>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    require_admin(&state, &headers)?;
    let logging = handle(&state)?;

    if request.filter.trim().is_empty() {
        return Err(ApiError::validation("filter must not be empty"));
    }
    logging.set_filter(request.filter.trim())?;

    Ok(Json(describe(logging)))
}
