//! Queue entry database models.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::{Error, Result};

/// Queue entry database model.
/// One row per unit of provider work; `id` is the dedup key.
#[derive(Debug, Clone, FromRow)]
pub struct QueueEntryDbModel {
    pub id: String,
    /// Provider class (`stability`, `openai`, ...)
    pub queue_type: String,
    /// Sub-operation (`structure`, `completion`, ...)
    pub entry_type: String,
    /// JSON blob matching the entry's `JobParams` variant
    pub params: String,
    pub status: String,
    pub trace: String,
    /// JSON blob written by the worker on completion or error
    pub result: Option<String>,
    pub retry_count: i64,
    /// Unix epoch milliseconds
    pub time_requested: i64,
    pub time_updated: i64,
    pub processing_started: Option<i64>,
    pub batch_id: Option<String>,
}

/// Provider classes. Each has its own dispatch loop.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum ProviderKind {
    Stability,
    Dalle,
    Modal,
    Wavespeed,
    Gemini,
    #[strum(serialize = "openai")]
    #[serde(rename = "openai")]
    OpenAi,
    Transcription,
    BookImport,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stability => "stability",
            Self::Dalle => "dalle",
            Self::Modal => "modal",
            Self::Wavespeed => "wavespeed",
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::Transcription => "transcription",
            Self::BookImport => "bookImport",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stability" => Some(Self::Stability),
            "dalle" => Some(Self::Dalle),
            "modal" => Some(Self::Modal),
            "wavespeed" => Some(Self::Wavespeed),
            "gemini" => Some(Self::Gemini),
            "openai" => Some(Self::OpenAi),
            "transcription" => Some(Self::Transcription),
            "bookImport" => Some(Self::BookImport),
            _ => None,
        }
    }

    /// Upper-case prefix for per-provider environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Self::Stability => "STABILITY",
            Self::Dalle => "DALLE",
            Self::Modal => "MODAL",
            Self::Wavespeed => "WAVESPEED",
            Self::Gemini => "GEMINI",
            Self::OpenAi => "OPENAI",
            Self::Transcription => "TRANSCRIPTION",
            Self::BookImport => "BOOK_IMPORT",
        }
    }
}

/// Sub-operations a provider can perform.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum EntryType {
    Structure,
    OutpaintTall,
    OutpaintWide,
    Style,
    Generate,
    Completion,
    Transcribe,
    Import,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structure => "structure",
            Self::OutpaintTall => "outpaintTall",
            Self::OutpaintWide => "outpaintWide",
            Self::Style => "style",
            Self::Generate => "generate",
            Self::Completion => "completion",
            Self::Transcribe => "transcribe",
            Self::Import => "import",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "structure" => Some(Self::Structure),
            "outpaintTall" => Some(Self::OutpaintTall),
            "outpaintWide" => Some(Self::OutpaintWide),
            "style" => Some(Self::Style),
            "generate" => Some(Self::Generate),
            "completion" => Some(Self::Completion),
            "transcribe" => Some(Self::Transcribe),
            "import" => Some(Self::Import),
            _ => None,
        }
    }
}

/// Entry lifecycle. Transitions only move forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    Complete,
    Error,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Queue document as exposed to callers and admin tooling.
///
/// Field names and status values are a wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub provider: ProviderKind,
    pub entry_type: EntryType,
    pub params: Value,
    pub status: EntryStatus,
    #[serde(default)]
    pub trace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub retry_count: u32,
    pub time_requested: i64,
    pub time_updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl QueueEntry {
    /// A fresh pending entry stamped with the current time.
    pub fn new_pending(
        id: impl Into<String>,
        provider: ProviderKind,
        entry_type: EntryType,
        params: Value,
    ) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            provider,
            entry_type,
            params,
            status: EntryStatus::Pending,
            trace: String::new(),
            result: None,
            retry_count: 0,
            time_requested: now,
            time_updated: now,
            processing_started: None,
            batch_id: None,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.id.ends_with(crate::queue::keys::RETRY_SUFFIX)
    }
}

impl TryFrom<QueueEntryDbModel> for QueueEntry {
    type Error = Error;

    fn try_from(row: QueueEntryDbModel) -> Result<Self> {
        let provider = ProviderKind::parse(&row.queue_type).ok_or_else(|| {
            Error::validation(format!("Unknown queue type '{}' on {}", row.queue_type, row.id))
        })?;
        let entry_type = EntryType::parse(&row.entry_type).ok_or_else(|| {
            Error::validation(format!("Unknown entry type '{}' on {}", row.entry_type, row.id))
        })?;
        let status = EntryStatus::parse(&row.status).ok_or_else(|| {
            Error::validation(format!("Unknown status '{}' on {}", row.status, row.id))
        })?;

        // Corrupt params stay visible as raw text; the worker rejects them at claim time.
        let params = serde_json::from_str(&row.params).unwrap_or(Value::String(row.params));
        let result = match row.result {
            Some(raw) => Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw))),
            None => None,
        };

        Ok(Self {
            id: row.id,
            provider,
            entry_type,
            params,
            status,
            trace: row.trace,
            result,
            retry_count: row.retry_count.max(0) as u32,
            time_requested: row.time_requested,
            time_updated: row.time_updated,
            processing_started: row.processing_started,
            batch_id: row.batch_id,
        })
    }
}
