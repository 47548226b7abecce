//! Batch status routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::database::models::BatchStatusView;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/batches/{id}", get(get_batch))
}

async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BatchStatusView>> {
    state
        .queue
        .batch_status(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Batch with id '{}' not found", id)))
}
