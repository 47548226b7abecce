//! Pipeline progress routes.
//!
//! Pipeline stages report step events here. Reads never fail for an unknown
//! SKU; they return a pending view at 0%.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
};
use serde::Deserialize;

use crate::api::error::ApiResult;
use crate::api::routes::require_admin;
use crate::api::server::AppState;
use crate::database::models::ProgressView;
use crate::progress::GraphStepUpdate;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/progress/{sku}", get(get_progress))
        .route("/api/progress/{sku}/transcription", post(transcription_step))
        .route("/api/progress/{sku}/graph", post(graph_step))
        .route("/api/progress/{sku}/chapters/{chapter}", post(chapter_event))
        .route("/api/progress/{sku}/available", post(mark_available))
        .route("/api/progress/{sku}/reset", post(reset))
}

async fn get_progress(State(state): State<AppState>, Path(sku): Path<String>) -> ApiResult<Json<ProgressView>> {
    Ok(Json(state.tracker.get_progress(&sku).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionStep {
    pub step: String,
    #[serde(default)]
    pub sub_progress: f64,
    #[serde(default)]
    pub description: Option<String>,
}

async fn transcription_step(
    State(state): State<AppState>,
    Path(sku): Path<String>,
    Json(event): Json<TranscriptionStep>,
) -> ApiResult<Json<ProgressView>> {
    let view = state
        .tracker
        .record_transcription_step(&sku, &event.step, event.sub_progress, event.description.as_deref())
        .await?;
    Ok(Json(view))
}

async fn graph_step(
    State(state): State<AppState>,
    Path(sku): Path<String>,
    Json(update): Json<GraphStepUpdate>,
) -> ApiResult<Json<ProgressView>> {
    Ok(Json(state.tracker.record_graph_step(&sku, &update).await?))
}

/// `processing` marks the chapter in flight or done with processing;
/// `completed` is the chapter-completion trigger.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ChapterEvent {
    Processing {
        #[serde(default = "default_true")]
        active: bool,
    },
    Completed,
}

fn default_true() -> bool {
    true
}

async fn chapter_event(
    State(state): State<AppState>,
    Path((sku, chapter)): Path<(String, u32)>,
    Json(event): Json<ChapterEvent>,
) -> ApiResult<Json<ProgressView>> {
    let view = match event {
        ChapterEvent::Processing { active } => {
            state.tracker.record_chapter_processing(&sku, chapter, active).await?
        }
        ChapterEvent::Completed => state.tracker.append_completed_chapter(&sku, chapter).await?,
    };
    Ok(Json(view))
}

async fn mark_available(State(state): State<AppState>, Path(sku): Path<String>) -> ApiResult<Json<ProgressView>> {
    Ok(Json(state.tracker.mark_graph_available(&sku).await?))
}

async fn reset(
    State(state): State<AppState>,
    Path(sku): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<ProgressView>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.tracker.reset(&sku).await?))
}
