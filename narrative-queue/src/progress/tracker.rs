//! Pipeline progress tracker.
//!
//! Every update is one read-compute-write transaction on the catalogue row,
//! touching only the `graphProgress` paths listed in each plan.
//! `chapterProgress.completedChapters` belongs to the chapter-completion
//! trigger and is only changed through [`ProgressTracker::append_completed_chapter`].

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::weights::ProgressWeights;
use crate::Result;
use crate::database::models::{GraphStatus, ProgressView};
use crate::database::repositories::{CatalogueRepository, ProgressWrite};
use crate::database::time::now_ms;

/// A graph-phase step event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphStepUpdate {
    pub step: String,
    /// Progress within the step, 0-100.
    #[serde(default)]
    pub step_progress: f64,
    /// 0-based chapter being processed.
    #[serde(default)]
    pub chapter: Option<u32>,
    #[serde(default)]
    pub total_chapters: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
}

impl GraphStepUpdate {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            ..Default::default()
        }
    }

    pub fn chapter(mut self, chapter: u32, total_chapters: u32) -> Self {
        self.chapter = Some(chapter);
        self.total_chapters = Some(total_chapters);
        self
    }

    pub fn step_progress(mut self, percent: f64) -> Self {
        self.step_progress = percent;
        self
    }
}

#[derive(Clone)]
pub struct ProgressTracker {
    catalogue: Arc<dyn CatalogueRepository>,
    weights: Arc<ProgressWeights>,
}

impl ProgressTracker {
    pub fn new(catalogue: Arc<dyn CatalogueRepository>, weights: ProgressWeights) -> Self {
        Self {
            catalogue,
            weights: Arc::new(weights),
        }
    }

    pub fn weights(&self) -> &ProgressWeights {
        &self.weights
    }

    /// Current progress. A missing record reads as pending at 0%.
    pub async fn get_progress(&self, sku: &str) -> Result<ProgressView> {
        let view = self
            .catalogue
            .get_progress(sku)
            .await?
            .unwrap_or_else(|| ProgressView::pending(sku));
        Ok(force_available(view))
    }

    pub async fn record_transcription_step(
        &self,
        sku: &str,
        step: &str,
        sub_progress: f64,
        description: Option<&str>,
    ) -> Result<ProgressView> {
        // Reject unknown steps before opening a transaction.
        self.weights.transcription_percent(step, sub_progress)?;

        let weights = self.weights.clone();
        let view = self
            .catalogue
            .merge_progress(sku, &|current: &ProgressView| {
                if current.graph_available {
                    return Ok(Vec::new());
                }
                let progress = &current.graph_progress;
                let transcription = weights.transcription_percent(step, sub_progress)?;
                let completion = weights
                    .completion(transcription, progress.graph_percent)
                    .max(progress.completion);

                let mut writes = vec![
                    ProgressWrite::field("$.currentStep", step),
                    ProgressWrite::field("$.transcriptionPercent", transcription),
                    ProgressWrite::field("$.completion", completion),
                    ProgressWrite::field("$.lastUpdated", now_ms()),
                ];
                if progress.status == GraphStatus::Pending {
                    writes.push(ProgressWrite::field("$.status", GraphStatus::Transcribing.as_str()));
                }
                if let Some(description) = description {
                    writes.push(ProgressWrite::field("$.description", description));
                }
                Ok(writes)
            })
            .await?;

        debug!(sku, step, completion = view.graph_progress.completion, "Transcription progress");
        Ok(force_available(view))
    }

    /// Record the graph pipeline's current step. Reaching the graph phase
    /// implies transcription is done.
    pub async fn record_graph_step(&self, sku: &str, update: &GraphStepUpdate) -> Result<ProgressView> {
        self.weights.graph_percent(&update.step, update.step_progress, 0, 0)?;

        let weights = self.weights.clone();
        let view = self
            .catalogue
            .merge_progress(sku, &|current: &ProgressView| {
                if current.graph_available {
                    return Ok(Vec::new());
                }
                let progress = &current.graph_progress;
                let chapter = update.chapter.unwrap_or(progress.chapter_progress.current_chapter);
                let total = update
                    .total_chapters
                    .unwrap_or(progress.chapter_progress.total_chapters);

                let graph = weights.graph_percent(&update.step, update.step_progress, chapter, total)?;
                let completion = weights.completion(100.0, graph).max(progress.completion);

                let mut writes = vec![
                    ProgressWrite::field("$.status", GraphStatus::Processing.as_str()),
                    ProgressWrite::field("$.currentStep", update.step.as_str()),
                    ProgressWrite::field("$.transcriptionPercent", 100.0),
                    ProgressWrite::field("$.graphPercent", graph),
                    ProgressWrite::field("$.completion", completion),
                    ProgressWrite::field("$.chapterProgress.currentChapter", chapter),
                    ProgressWrite::field("$.chapterProgress.totalChapters", total),
                    ProgressWrite::field("$.lastUpdated", now_ms()),
                ];
                if let Some(description) = &update.description {
                    writes.push(ProgressWrite::field("$.description", description.as_str()));
                }
                Ok(writes)
            })
            .await?;

        debug!(
            sku,
            step = %update.step,
            chapter = view.graph_progress.chapter_progress.current_chapter,
            completion = view.graph_progress.completion,
            "Graph progress"
        );
        Ok(force_available(view))
    }

    /// Add or remove `chapter` from `chapterProgress.processingChapters`.
    pub async fn record_chapter_processing(
        &self,
        sku: &str,
        chapter: u32,
        processing: bool,
    ) -> Result<ProgressView> {
        let view = self
            .catalogue
            .merge_progress(sku, &|current: &ProgressView| {
                let mut chapters = current.graph_progress.chapter_progress.processing_chapters.clone();
                let present = chapters.contains(&chapter);
                if processing == present {
                    return Ok(Vec::new());
                }
                if processing {
                    chapters.push(chapter);
                    chapters.sort_unstable();
                } else {
                    chapters.retain(|c| *c != chapter);
                }
                Ok(vec![
                    ProgressWrite::field("$.chapterProgress.processingChapters", chapters),
                    ProgressWrite::field("$.lastUpdated", now_ms()),
                ])
            })
            .await?;
        Ok(force_available(view))
    }

    pub async fn append_completed_chapter(&self, sku: &str, chapter: u32) -> Result<ProgressView> {
        let view = self.catalogue.append_completed_chapter(sku, chapter).await?;
        debug!(sku, chapter, "Chapter completed");
        Ok(force_available(view))
    }

    /// Set the graph-available flag. Completion is 100 from then on.
    pub async fn mark_graph_available(&self, sku: &str) -> Result<ProgressView> {
        let view = self
            .catalogue
            .merge_progress(sku, &|_: &ProgressView| {
                Ok(vec![
                    ProgressWrite::GraphAvailable(true),
                    ProgressWrite::field("$.status", GraphStatus::Complete.as_str()),
                    ProgressWrite::field("$.transcriptionPercent", 100.0),
                    ProgressWrite::field("$.graphPercent", 100.0),
                    ProgressWrite::field("$.completion", 100),
                    ProgressWrite::field("$.lastUpdated", now_ms()),
                ])
            })
            .await?;
        info!(sku, "Graph available");
        Ok(view)
    }

    /// Administrative reset. The only operation that lowers `completion`.
    pub async fn reset(&self, sku: &str) -> Result<ProgressView> {
        let view = self
            .catalogue
            .merge_progress(sku, &|_: &ProgressView| {
                Ok(vec![
                    ProgressWrite::GraphAvailable(false),
                    ProgressWrite::field("$.status", GraphStatus::Pending.as_str()),
                    ProgressWrite::field("$.currentStep", Value::Null),
                    ProgressWrite::field("$.completion", 0),
                    ProgressWrite::field("$.description", ""),
                    ProgressWrite::field("$.transcriptionPercent", 0.0),
                    ProgressWrite::field("$.graphPercent", 0.0),
                    ProgressWrite::field("$.chapterProgress.currentChapter", 0),
                    ProgressWrite::field("$.chapterProgress.processingChapters", Vec::<u32>::new()),
                    ProgressWrite::field("$.lastUpdated", now_ms()),
                ])
            })
            .await?;
        info!(sku, "Progress reset");
        Ok(view)
    }
}

fn force_available(mut view: ProgressView) -> ProgressView {
    if view.graph_available {
        view.graph_progress.completion = 100;
    }
    view
}
