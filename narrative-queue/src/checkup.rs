//! Periodic sweep for entries stuck in `processing` and batches that stopped moving.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::Result;
use crate::database::models::{BatchStatus, ProviderKind};
use crate::database::repositories::{BatchRepository, QueueRepository};
use crate::database::time::{ms_to_datetime, now_ms};

/// Appended to the trace of a stuck entry. Written once per entry.
pub const STUCK_MARKER: &str = "[checkup] stuck in processing";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub provider: ProviderKind,
    pub processing_started: DateTime<Utc>,
    /// Whether this sweep added the marker. False if an earlier sweep did.
    pub newly_marked: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleBatch {
    pub batch_id: String,
    pub status: BatchStatus,
    pub completion_percentage: u32,
    pub processing_items: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckupReport {
    pub checked_at: DateTime<Utc>,
    pub stuck_entries: Vec<StuckEntry>,
    pub stale_batches: Vec<StaleBatch>,
}

#[derive(Clone)]
pub struct Checkup {
    queue: Arc<dyn QueueRepository>,
    batches: Arc<dyn BatchRepository>,
    stuck_after: Duration,
}

impl Checkup {
    pub fn new(queue: Arc<dyn QueueRepository>, batches: Arc<dyn BatchRepository>, stuck_after: Duration) -> Self {
        Self {
            queue,
            batches,
            stuck_after,
        }
    }

    pub async fn run(&self) -> Result<CheckupReport> {
        self.run_at(now_ms()).await
    }

    /// Sweep as of `now` (epoch ms). Statuses are never changed.
    pub async fn run_at(&self, now: i64) -> Result<CheckupReport> {
        let cutoff = now.saturating_sub(self.stuck_after.as_millis() as i64);

        let mut stuck_entries = Vec::new();
        for entry in self.queue.list_stuck(cutoff).await? {
            let newly_marked = self.queue.append_trace(&entry.id, STUCK_MARKER).await?;
            if newly_marked {
                warn!(entry_id = %entry.id, provider = %entry.provider, "Entry stuck in processing");
            }
            stuck_entries.push(StuckEntry {
                processing_started: ms_to_datetime(entry.processing_started.unwrap_or(entry.time_updated)),
                id: entry.id,
                provider: entry.provider,
                newly_marked,
            });
        }

        let stale_batches: Vec<StaleBatch> = self
            .batches
            .list_stale(cutoff)
            .await?
            .into_iter()
            .map(|batch| StaleBatch {
                completion_percentage: batch.completion_percentage(),
                updated_at: ms_to_datetime(batch.updated_at),
                processing_items: batch.processing_items,
                status: batch.status,
                batch_id: batch.batch_id,
            })
            .collect();

        info!(
            stuck = stuck_entries.len(),
            stale_batches = stale_batches.len(),
            "Checkup finished"
        );

        Ok(CheckupReport {
            checked_at: ms_to_datetime(now),
            stuck_entries,
            stale_batches,
        })
    }
}
