//! Delta-based batch counters with a one-shot completion signal.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::webhook::CompletionNotifier;
use crate::Result;
use crate::database::repositories::{BatchCountOutcome, BatchDelta, BatchRepository};

#[derive(Clone)]
pub struct BatchAggregator {
    batches: Arc<dyn BatchRepository>,
    notifier: Arc<dyn CompletionNotifier>,
}

impl BatchAggregator {
    pub fn new(batches: Arc<dyn BatchRepository>, notifier: Arc<dyn CompletionNotifier>) -> Self {
        Self { batches, notifier }
    }

    /// Apply `delta` to the batch and deliver the completion signal if this
    /// update completed it.
    ///
    /// The counter update is committed before delivery. A failed delivery is
    /// logged and not retried.
    pub async fn apply(&self, batch_id: &str, delta: BatchDelta) -> Result<BatchCountOutcome> {
        let outcome = self.batches.update_counts(batch_id, delta).await?;
        debug!(
            batch_id,
            completed = outcome.batch.completed_items,
            failed = outcome.batch.failed_items,
            processing = outcome.batch.processing_items,
            total = outcome.batch.total_items,
            "Batch counters updated"
        );

        if outcome.should_fire_webhook {
            info!(batch_id, "Batch complete");
            if let Some(url) = outcome.webhook_url.as_deref().filter(|u| !u.is_empty())
                && let Err(e) = self.notifier.notify(url, &outcome.batch).await
            {
                warn!(batch_id, "Batch completion delivery failed: {}", e);
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;
    use crate::database::models::{Batch, BatchStatus};
    use crate::database::repositories::SqlxBatchRepository;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CompletionNotifier for Recorder {
        async fn notify(&self, url: &str, batch: &Batch) -> Result<()> {
            self.calls
                .lock()
                .push((url.to_string(), batch.batch_id.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_notifier_called_once() {
        let repo = Arc::new(SqlxBatchRepository::new(init_memory_pool().await.unwrap()));
        repo.create_batch(&Batch {
            batch_id: "b1".into(),
            queue_name: "openai".into(),
            total_items: 1,
            completed_items: 0,
            failed_items: 0,
            processing_items: 0,
            status: BatchStatus::Pending,
            webhook_url: Some("http://hooks.local/b1".into()),
            metadata: serde_json::json!({}),
            created_at: 1,
            updated_at: 1,
            completed_at: None,
        })
        .await
        .unwrap();

        let recorder = Arc::new(Recorder::default());
        let aggregator = BatchAggregator::new(repo, recorder.clone());

        aggregator.apply("b1", BatchDelta::claimed()).await.unwrap();
        assert!(recorder.calls.lock().is_empty());

        let out = aggregator.apply("b1", BatchDelta::completed()).await.unwrap();
        assert!(out.should_fire_webhook);
        aggregator.apply("b1", BatchDelta::completed()).await.unwrap();

        let calls = recorder.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("http://hooks.local/b1".to_string(), "b1".to_string()));
    }
}
