//! Enqueue-side operations: validation, dedup keys, batches.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::keys::{entry_key, retry_key};
use super::params::JobParams;
use crate::database::models::{
    Batch, BatchStatus, BatchStatusView, EntryType, ProviderKind, QueueEntry,
};
use crate::database::repositories::{BatchRepository, QueueRepository};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// One entry as submitted by a caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEntry {
    #[serde(rename = "type")]
    pub provider: ProviderKind,
    pub entry_type: EntryType,
    pub params: Value,
    /// Submit as the retry twin (`_retry` id).
    #[serde(default)]
    pub retry: bool,
}

impl NewEntry {
    pub fn new(provider: ProviderKind, entry_type: EntryType, params: Value) -> Self {
        Self {
            provider,
            entry_type,
            params,
            retry: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOutcome {
    /// Ids written by this call.
    pub created: Vec<String>,
    /// Ids that already existed or repeated an earlier entry of the submission.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub queue_name: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnqueueOutcome {
    pub batch: Batch,
    #[serde(flatten)]
    pub entries: EnqueueOutcome,
}

/// Validate, key and deduplicate a submission. The first occurrence of an id wins.
pub fn prepare_entries(entries: &[NewEntry]) -> Result<(Vec<QueueEntry>, Vec<String>)> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut prepared = Vec::with_capacity(entries.len());
    let mut repeated = Vec::new();

    // Timestamps only need to be non-decreasing in submission order.
    let now = now_ms();
    for new in entries {
        let params = JobParams::parse(new.provider, new.entry_type, &new.params)?;
        let id = entry_key(new.provider, &params, new.retry)?;

        if !seen.insert(id.clone()) {
            debug!(entry_id = %id, "Dropping repeated entry in submission");
            repeated.push(id);
            continue;
        }

        let mut entry = QueueEntry::new_pending(id, new.provider, new.entry_type, new.params.clone());
        entry.time_requested = now;
        entry.time_updated = now;
        if new.retry {
            entry.retry_count = 1;
        }
        prepared.push(entry);
    }

    Ok((prepared, repeated))
}

/// Blank means no webhook. Anything else must be an absolute http(s) URL.
fn validate_webhook_url(raw: &str) -> Result<Option<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let parsed = Url::parse(raw)
        .map_err(|e| Error::validation(format!("invalid webhookUrl '{}': {}", raw, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::validation(format!(
            "webhookUrl must be http or https, got '{}'",
            parsed.scheme()
        )));
    }
    Ok(Some(parsed.to_string()))
}

fn split_outcome(prepared: &[QueueEntry], created: Vec<String>, mut skipped: Vec<String>) -> EnqueueOutcome {
    let created_set: HashSet<&str> = created.iter().map(String::as_str).collect();
    skipped.extend(
        prepared
            .iter()
            .filter(|e| !created_set.contains(e.id.as_str()))
            .map(|e| e.id.clone()),
    );
    EnqueueOutcome { created, skipped }
}

/// Caller-facing queue operations.
#[derive(Clone)]
pub struct QueueService {
    queue: Arc<dyn QueueRepository>,
    batches: Arc<dyn BatchRepository>,
}

impl QueueService {
    pub fn new(queue: Arc<dyn QueueRepository>, batches: Arc<dyn BatchRepository>) -> Self {
        Self { queue, batches }
    }

    pub fn queue(&self) -> &Arc<dyn QueueRepository> {
        &self.queue
    }

    pub fn batches(&self) -> &Arc<dyn BatchRepository> {
        &self.batches
    }

    /// Create-if-absent for every entry. Nothing is written if any entry is invalid.
    pub async fn enqueue(&self, entries: &[NewEntry]) -> Result<EnqueueOutcome> {
        let (prepared, repeated) = prepare_entries(entries)?;
        let created = self.queue.add_entries(&prepared).await?;
        let outcome = split_outcome(&prepared, created, repeated);

        info!(
            created = outcome.created.len(),
            skipped = outcome.skipped.len(),
            "Enqueued entries"
        );
        Ok(outcome)
    }

    /// Enqueue entries under a new batch. `totalItems` counts only created entries.
    pub async fn enqueue_batch(
        &self,
        request: BatchRequest,
        entries: &[NewEntry],
    ) -> Result<BatchEnqueueOutcome> {
        let webhook_url = request
            .webhook_url
            .map(|raw| validate_webhook_url(&raw))
            .transpose()?
            .flatten();
        let (mut prepared, repeated) = prepare_entries(entries)?;

        let batch_id = Uuid::new_v4().to_string();
        for entry in &mut prepared {
            entry.batch_id = Some(batch_id.clone());
        }

        let now = now_ms();
        let batch = Batch {
            batch_id: batch_id.clone(),
            queue_name: request.queue_name,
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
            processing_items: 0,
            status: BatchStatus::Pending,
            webhook_url,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let (batch, created) = self.queue.add_batch(batch, &prepared).await?;
        let entries = split_outcome(&prepared, created, repeated);

        info!(
            batch_id = %batch.batch_id,
            total = batch.total_items,
            skipped = entries.skipped.len(),
            "Enqueued batch"
        );
        Ok(BatchEnqueueOutcome { batch, entries })
    }

    pub async fn batch_status(&self, batch_id: &str) -> Result<Option<BatchStatusView>> {
        Ok(self.batches.get_batch(batch_id).await?.map(BatchStatusView::from))
    }

    /// Enqueue the single retry twin of a failed entry. Returns the new id, or
    /// `None` if `entry` is itself a retry or the twin already exists.
    pub async fn requeue_retry(&self, entry: &QueueEntry) -> Result<Option<String>> {
        let Some(id) = retry_key(&entry.id) else {
            return Ok(None);
        };

        let mut twin = QueueEntry::new_pending(&id, entry.provider, entry.entry_type, entry.params.clone());
        twin.retry_count = entry.retry_count + 1;
        twin.batch_id = entry.batch_id.clone();
        twin.trace = format!("retry of {}", entry.id);

        let created = self.queue.add_entries(&[twin]).await?;
        Ok(created.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;
    use crate::database::models::EntryStatus;
    use crate::database::repositories::{EntryQuery, SqlxBatchRepository, SqlxQueueRepository};
    use crate::Error;
    use serde_json::json;

    async fn service() -> QueueService {
        let pool = init_memory_pool().await.unwrap();
        QueueService::new(
            Arc::new(SqlxQueueRepository::new(pool.clone())),
            Arc::new(SqlxBatchRepository::new(pool)),
        )
    }

    fn structure(scene: &str) -> NewEntry {
        NewEntry::new(
            ProviderKind::Stability,
            EntryType::Structure,
            json!({"sceneId": scene, "chapter": 0, "scene_number": 2, "imageUrl": "https://img/x.png"}),
        )
    }

    #[tokio::test]
    async fn test_enqueue_twice_stores_one_entry() {
        let service = service().await;

        let first = service.enqueue(&[structure("S1")]).await.unwrap();
        assert_eq!(first.created, vec!["stability_structure_S1_0_2".to_string()]);

        let second = service.enqueue(&[structure("S1")]).await.unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.skipped, vec!["stability_structure_S1_0_2".to_string()]);

        let stored = service
            .queue()
            .get_entries(&EntryQuery::by_param("sceneId", json!("S1")))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "stability_structure_S1_0_2");
    }

    #[tokio::test]
    async fn test_submission_dedup_keeps_first() {
        let service = service().await;
        let mut later = structure("S1");
        later.params["prompt"] = json!("second");

        let outcome = service.enqueue(&[structure("S1"), later]).await.unwrap();
        assert_eq!(outcome.created.len(), 1);
        assert_eq!(outcome.skipped.len(), 1);

        let stored = service.queue().get_entry(&outcome.created[0]).await.unwrap().unwrap();
        assert!(stored.params.get("prompt").is_none());
    }

    #[tokio::test]
    async fn test_invalid_entry_rejects_whole_submission() {
        let service = service().await;
        let bad = NewEntry::new(
            ProviderKind::Stability,
            EntryType::Structure,
            json!({"chapter": 0, "sceneNumber": 2, "imageUrl": "u"}),
        );

        let err = service.enqueue(&[structure("S1"), bad]).await.unwrap_err();
        assert!(matches!(err, Error::IdentityIncomplete { field: "sceneId" }));
        assert!(service.queue().get_entry("stability_structure_S1_0_2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_batch_counts_created_only() {
        let service = service().await;
        service.enqueue(&[structure("S1")]).await.unwrap();

        let outcome = service
            .enqueue_batch(
                BatchRequest {
                    queue_name: "stability".to_string(),
                    webhook_url: Some("http://hooks.local/b".to_string()),
                    metadata: json!({"sku": "b1"}),
                },
                &[structure("S1"), structure("S2"), structure("S3")],
            )
            .await
            .unwrap();

        assert_eq!(outcome.batch.total_items, 2);
        assert_eq!(outcome.entries.skipped, vec!["stability_structure_S1_0_2".to_string()]);

        let members = service
            .queue()
            .get_entries(&EntryQuery::by_batch(&outcome.batch.batch_id))
            .await
            .unwrap();
        assert_eq!(members.len(), 2);

        let view = service.batch_status(&outcome.batch.batch_id).await.unwrap().unwrap();
        assert_eq!(view.completion_percentage, 0);
        assert!(!view.is_complete);
    }

    #[tokio::test]
    async fn test_batch_webhook_url_is_validated() {
        let service = service().await;
        let request = |url: &str| BatchRequest {
            queue_name: "stability".to_string(),
            webhook_url: Some(url.to_string()),
            metadata: json!({}),
        };

        let err = service
            .enqueue_batch(request("ftp://hooks.local/b"), &[structure("S1")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let outcome = service
            .enqueue_batch(request("  "), &[structure("S1")])
            .await
            .unwrap();
        assert_eq!(outcome.batch.webhook_url, None);
    }

    #[tokio::test]
    async fn test_empty_batch_is_complete() {
        let service = service().await;
        service.enqueue(&[structure("S1")]).await.unwrap();
        let outcome = service
            .enqueue_batch(
                BatchRequest {
                    queue_name: "stability".to_string(),
                    ..Default::default()
                },
                &[structure("S1")],
            )
            .await
            .unwrap();
        assert_eq!(outcome.batch.status, BatchStatus::Complete);
        assert_eq!(outcome.batch.total_items, 0);
    }

    #[tokio::test]
    async fn test_requeue_retry_only_once() {
        let service = service().await;
        service.enqueue(&[structure("S1")]).await.unwrap();
        let original = service
            .queue()
            .get_entry("stability_structure_S1_0_2")
            .await
            .unwrap()
            .unwrap();

        let twin_id = service.requeue_retry(&original).await.unwrap().unwrap();
        assert_eq!(twin_id, "stability_structure_S1_0_2_retry");
        assert_eq!(service.requeue_retry(&original).await.unwrap(), None);

        let twin = service.queue().get_entry(&twin_id).await.unwrap().unwrap();
        assert_eq!(twin.status, EntryStatus::Pending);
        assert_eq!(twin.retry_count, 1);
        assert!(twin.is_retry());
        assert_eq!(service.requeue_retry(&twin).await.unwrap(), None);
    }
}
