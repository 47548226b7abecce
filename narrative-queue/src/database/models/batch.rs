//! Batch database models.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::{Error, Result};

/// Batch database model.
#[derive(Debug, Clone, FromRow)]
pub struct BatchDbModel {
    pub batch_id: String,
    pub queue_name: String,
    pub total_items: i64,
    pub completed_items: i64,
    pub failed_items: i64,
    pub processing_items: i64,
    pub status: String,
    pub webhook_url: Option<String>,
    /// JSON blob supplied by the caller at enqueue time
    pub metadata: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Complete,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Batch document. Also the webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_id: String,
    pub queue_name: String,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    pub processing_items: u32,
    pub status: BatchStatus,
    pub webhook_url: Option<String>,
    pub metadata: Value,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl Batch {
    /// Finished items over total, rounded to a whole percent.
    pub fn completion_percentage(&self) -> u32 {
        if self.total_items == 0 {
            return 100;
        }
        let done = (self.completed_items + self.failed_items).min(self.total_items);
        ((done as f64 / self.total_items as f64) * 100.0).round() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.completed_items + self.failed_items >= self.total_items
    }
}

impl TryFrom<BatchDbModel> for Batch {
    type Error = Error;

    fn try_from(row: BatchDbModel) -> Result<Self> {
        let status = BatchStatus::parse(&row.status).ok_or_else(|| {
            Error::validation(format!(
                "Unknown batch status '{}' on {}",
                row.status, row.batch_id
            ))
        })?;
        let metadata = serde_json::from_str(&row.metadata).unwrap_or(Value::Null);

        Ok(Self {
            batch_id: row.batch_id,
            queue_name: row.queue_name,
            total_items: row.total_items.max(0) as u32,
            completed_items: row.completed_items.max(0) as u32,
            failed_items: row.failed_items.max(0) as u32,
            processing_items: row.processing_items.max(0) as u32,
            status,
            webhook_url: row.webhook_url,
            metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// Batch document plus derived completion fields, as returned by status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusView {
    #[serde(flatten)]
    pub batch: Batch,
    pub completion_percentage: u32,
    pub is_complete: bool,
}

impl From<Batch> for BatchStatusView {
    fn from(batch: Batch) -> Self {
        Self {
            completion_percentage: batch.completion_percentage(),
            is_complete: batch.is_complete(),
            batch,
        }
    }
}
