//! Provider dispatch routes.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::database::models::ProviderKind;
use crate::dispatch::LaunchOutcome;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/providers", get(list_providers))
        .route("/api/providers/{type}/run", post(run_provider))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(rename = "type")]
    pub provider: ProviderKind,
    pub running: bool,
}

async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderStatus>> {
    Json(
        state
            .dispatcher
            .providers()
            .into_iter()
            .map(|provider| ProviderStatus {
                provider,
                running: state.dispatcher.is_running(provider),
            })
            .collect(),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct RunParams {
    /// Drain the queue before responding.
    #[serde(default)]
    pub wait: bool,
}

async fn run_provider(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<RunParams>,
) -> ApiResult<Json<LaunchOutcome>> {
    let provider = ProviderKind::parse(&provider)
        .ok_or_else(|| ApiError::not_found(format!("unknown provider type '{}'", provider)))?;
    let outcome = state.dispatcher.launch(provider, params.wait).await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::api::routes::test_support::{call, state};

    #[tokio::test]
    async fn test_unknown_and_unregistered_providers() {
        let (state, _dir) = state().await;

        let (status, _) = call(&state, "POST", "/api/providers/midjourney/run", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Known type without a registered worker.
        let (status, _) = call(&state, "POST", "/api/providers/modal/run", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&state, "GET", "/api/providers", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["running"], false);
    }

    #[tokio::test]
    async fn test_launch_without_wait_spawns() {
        let (state, _dir) = state().await;
        let (status, body) = call(&state, "POST", "/api/providers/stability/run", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "spawned");
        state.dispatcher.shutdown().await;
    }
}
