//! Catalogue database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Catalogue record. Only the progress-related columns are modelled here.
#[derive(Debug, Clone, FromRow)]
pub struct CatalogueDbModel {
    pub sku: String,
    pub title: Option<String>,
    /// Set by the graph pipeline once its output is published.
    pub graph_available: i64,
    /// JSON document, written by field path only
    pub graph_progress: String,
    pub updated_at: i64,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GraphStatus {
    #[default]
    Pending,
    Transcribing,
    Processing,
    Complete,
}

impl GraphStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Transcribing => "transcribing",
            Self::Processing => "processing",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChapterProgress {
    pub current_chapter: u32,
    /// Appended by the chapter-completion trigger, never by the tracker.
    pub completed_chapters: Vec<u32>,
    pub total_chapters: u32,
    pub processing_chapters: Vec<u32>,
}

/// Progress document embedded in a catalogue record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphProgress {
    pub status: GraphStatus,
    pub current_step: Option<String>,
    /// Blended 0-100 completion.
    pub completion: u32,
    pub description: String,
    pub chapter_progress: ChapterProgress,
    /// Transcription phase percent (0-100).
    pub transcription_percent: f64,
    /// Graph phase percent (0-100).
    pub graph_percent: f64,
    pub last_updated: Option<i64>,
}

/// Read view returned to callers. A missing record reads as pending at 0%.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub sku: String,
    pub graph_available: bool,
    pub graph_progress: GraphProgress,
}

impl ProgressView {
    pub fn pending(sku: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            ..Default::default()
        }
    }
}

impl From<CatalogueDbModel> for ProgressView {
    fn from(row: CatalogueDbModel) -> Self {
        let graph_progress = serde_json::from_str(&row.graph_progress).unwrap_or_else(|e| {
            tracing::warn!(sku = %row.sku, "Unreadable graphProgress, using default: {}", e);
            GraphProgress::default()
        });
        Self {
            sku: row.sku,
            graph_available: row.graph_available != 0,
            graph_progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let progress: GraphProgress =
            serde_json::from_str(r#"{"completion": 40, "chapterProgress": {"totalChapters": 4}}"#)
                .unwrap();
        assert_eq!(progress.completion, 40);
        assert_eq!(progress.status, GraphStatus::Pending);
        assert_eq!(progress.chapter_progress.total_chapters, 4);
        assert!(progress.chapter_progress.completed_chapters.is_empty());
    }

    #[test]
    fn test_view_from_row() {
        let row = CatalogueDbModel {
            sku: "sku-1".to_string(),
            title: None,
            graph_available: 1,
            graph_progress: "{}".to_string(),
            updated_at: 0,
        };
        let view = ProgressView::from(row);
        assert!(view.graph_available);
        assert_eq!(view.graph_progress, GraphProgress::default());
    }
}
