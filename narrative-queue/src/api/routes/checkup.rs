use axum::{Json, Router, extract::State, routing::post};

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::checkup::CheckupReport;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/checkup", post(run_checkup))
}

async fn run_checkup(State(state): State<AppState>) -> ApiResult<Json<CheckupReport>> {
    Ok(Json(state.checkup.run().await?))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::api::routes::test_support::{call, state};

    #[tokio::test]
    async fn test_checkup_on_empty_queue() {
        let (state, _dir) = state().await;
        let (status, body) = call(&state, "POST", "/api/checkup", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stuckEntries"].as_array().unwrap().len(), 0);
        assert_eq!(body["staleBatches"].as_array().unwrap().len(), 0);
    }
}
