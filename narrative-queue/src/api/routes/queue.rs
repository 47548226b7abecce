//! Queue entry routes.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::require_admin;
use crate::api::server::AppState;
use crate::database::models::{EntryStatus, ProviderKind, QueueEntry};
use crate::database::repositories::{EntryQuery, EntryUpdate};
use crate::queue::{BatchRequest, NewEntry};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/queue/entries",
            post(enqueue)
                .get(list_entries)
                .patch(update_entries)
                .delete(delete_entries),
        )
        .route("/api/queue", delete(nuke))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub entries: Vec<NewEntry>,
    /// Present to enqueue the entries as one batch.
    #[serde(default)]
    pub batch: Option<BatchRequest>,
}

async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.entries.is_empty() && request.batch.is_none() {
        return Err(ApiError::validation("entries must not be empty"));
    }

    let body = match request.batch {
        Some(batch) => serde_json::to_value(state.queue.enqueue_batch(batch, &request.entries).await?),
        None => serde_json::to_value(state.queue.enqueue(&request.entries).await?),
    }
    .map_err(|e| ApiError::internal(e.to_string()))?;

    Ok((StatusCode::CREATED, Json(body)))
}

/// Query string form of [`EntryQuery`]. Values arrive as strings and are
/// parsed here so bad input is a 422 instead of a generic rejection.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryQueryParams {
    pub id: Option<String>,
    pub batch_id: Option<String>,
    pub param_field: Option<String>,
    /// JSON literal (`0`, `true`, `"S1"`) or a bare string.
    pub param_value: Option<String>,
    #[serde(rename = "type")]
    pub provider: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub time_requested_after: Option<i64>,
}

impl EntryQueryParams {
    fn into_query(self) -> ApiResult<EntryQuery> {
        let provider = self
            .provider
            .map(|p| ProviderKind::parse(&p).ok_or_else(|| ApiError::validation(format!("unknown type '{}'", p))))
            .transpose()?;
        let status = self
            .status
            .map(|s| EntryStatus::parse(&s).ok_or_else(|| ApiError::validation(format!("unknown status '{}'", s))))
            .transpose()?;
        let param_value = self
            .param_value
            .map(|raw| serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw)));

        Ok(EntryQuery {
            id: self.id,
            batch_id: self.batch_id,
            param_field: self.param_field,
            param_value,
            provider,
            status,
            limit: self.limit,
            time_requested_after: self.time_requested_after,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct EntriesResponse {
    pub entries: Vec<QueueEntry>,
    pub count: usize,
}

async fn list_entries(
    State(state): State<AppState>,
    Query(params): Query<EntryQueryParams>,
) -> ApiResult<Json<EntriesResponse>> {
    let query = params.into_query()?;
    let entries = state.queue.queue().get_entries(&query).await?;
    Ok(Json(EntriesResponse {
        count: entries.len(),
        entries,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub updates: Vec<EntryUpdate>,
}

async fn update_entries(
    State(state): State<AppState>,
    Json(request): Json<UpdateRequest>,
) -> ApiResult<Json<Value>> {
    let updated = state.queue.queue().update_entries(&request.updates).await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub ids: Vec<String>,
}

async fn delete_entries(
    State(state): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> ApiResult<Json<Value>> {
    let deleted = state.queue.queue().delete_entries(&request.ids).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

async fn nuke(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let deleted = state.queue.queue().nuke().await?;
    warn!(deleted, "Queue nuked");
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::test_support::{ADMIN, call, state};
    use serde_json::json;

    fn structure_entry() -> Value {
        json!({
            "type": "stability",
            "entryType": "structure",
            "params": {"sceneId": "S1", "chapter": 0, "scene_number": 2, "imageUrl": "https://img/1.png"}
        })
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_over_http() {
        let (state, _dir) = state().await;

        let (status, body) = call(
            &state,
            "POST",
            "/api/queue/entries",
            Some(json!({"entries": [structure_entry()]})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["created"], json!(["stability_structure_S1_0_2"]));

        let (_, body) = call(
            &state,
            "POST",
            "/api/queue/entries",
            Some(json!({"entries": [structure_entry()]})),
            None,
        )
        .await;
        assert_eq!(body["skipped"], json!(["stability_structure_S1_0_2"]));

        let (status, body) = call(
            &state,
            "GET",
            "/api/queue/entries?paramField=sceneId&paramValue=S1",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["status"], "pending");
    }

    #[tokio::test]
    async fn test_missing_identity_is_unprocessable() {
        let (state, _dir) = state().await;
        let (status, body) = call(
            &state,
            "POST",
            "/api/queue/entries",
            Some(json!({"entries": [{
                "type": "stability",
                "entryType": "structure",
                "params": {"sceneId": "S1", "chapter": 0, "imageUrl": "https://img/1.png"}
            }]})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["details"]["field"], "sceneNumber");
    }

    #[tokio::test]
    async fn test_unknown_type_in_query() {
        let (state, _dir) = state().await;
        let (status, _) = call(&state, "GET", "/api/queue/entries?type=midjourney", None, None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_nuke_requires_admin_token() {
        let (state, _dir) = state().await;
        call(
            &state,
            "POST",
            "/api/queue/entries",
            Some(json!({"entries": [structure_entry()]})),
            None,
        )
        .await;

        let (status, _) = call(&state, "DELETE", "/api/queue", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&state, "DELETE", "/api/queue", None, Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&state, "DELETE", "/api/queue", None, Some(ADMIN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 1);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (state, _dir) = state().await;
        call(
            &state,
            "POST",
            "/api/queue/entries",
            Some(json!({"entries": [structure_entry()]})),
            None,
        )
        .await;

        let (status, body) = call(
            &state,
            "PATCH",
            "/api/queue/entries",
            Some(json!({"updates": [{"id": "stability_structure_S1_0_2", "trace": "looked at"}]})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], 1);

        let (_, body) = call(
            &state,
            "DELETE",
            "/api/queue/entries",
            Some(json!({"ids": ["stability_structure_S1_0_2", "missing"]})),
            None,
        )
        .await;
        assert_eq!(body["deleted"], 1);
    }
}
