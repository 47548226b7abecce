//! The seam between a worker and a provider backend.

use async_trait::async_trait;
use serde_json::Value;

use super::attempt::Attempt;
use super::error::ProviderError;
use crate::database::models::{EntryType, QueueEntry};
use crate::queue::JobParams;

/// Everything a handler needs for one provider call.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub entry: QueueEntry,
    pub params: JobParams,
    pub attempt: Attempt,
}

impl JobContext {
    pub fn new(entry: QueueEntry, params: JobParams, attempt: Attempt) -> Self {
        Self {
            entry,
            params,
            attempt,
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.entry.id
    }

    pub fn with_attempt(&self, attempt: Attempt) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

/// Executes the external call for one claimed entry.
///
/// Handlers do not retry. The worker owns the retry schedule and calls
/// `handle` again with the next [`Attempt`].
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, entry_type: EntryType) -> bool;

    /// Run the call and return the JSON written to the entry's `result`.
    async fn handle(&self, ctx: &JobContext) -> Result<Value, ProviderError>;
}
