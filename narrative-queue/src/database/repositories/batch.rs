//! Batch repository.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use crate::database::begin_immediate;
use crate::database::models::{Batch, BatchDbModel, BatchStatus};
use crate::database::retry::retry_on_contention;
use crate::database::time::now_ms;
use crate::domain::RetryPolicy;
use crate::{Error, Result};

/// Signed counter changes applied by one `update_counts` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchDelta {
    pub completed: i64,
    pub failed: i64,
    pub processing: i64,
}

impl BatchDelta {
    /// An entry of the batch was claimed.
    pub fn claimed() -> Self {
        Self {
            processing: 1,
            ..Default::default()
        }
    }

    /// A claimed entry finished successfully.
    pub fn completed() -> Self {
        Self {
            completed: 1,
            processing: -1,
            ..Default::default()
        }
    }

    /// A claimed entry finished with an error.
    pub fn failed() -> Self {
        Self {
            failed: 1,
            processing: -1,
            ..Default::default()
        }
    }
}

/// Result of a counter update.
#[derive(Debug, Clone)]
pub struct BatchCountOutcome {
    pub batch: Batch,
    /// True only for the update that moved the batch to `complete`.
    pub should_fire_webhook: bool,
    pub webhook_url: Option<String>,
}

/// Batch repository trait.
#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn create_batch(&self, batch: &Batch) -> Result<()>;
    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>>;
    /// Apply counter deltas in one transaction, retrying on contention.
    async fn update_counts(&self, batch_id: &str, delta: BatchDelta) -> Result<BatchCountOutcome>;
    /// Non-complete batches not touched since `updated_before` (epoch ms).
    async fn list_stale(&self, updated_before: i64) -> Result<Vec<Batch>>;
}

/// SQLx implementation of BatchRepository.
pub struct SqlxBatchRepository {
    pool: SqlitePool,
    contention: RetryPolicy,
}

impl SqlxBatchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            contention: RetryPolicy::contention(),
        }
    }

    pub fn with_contention_policy(mut self, policy: RetryPolicy) -> Self {
        self.contention = policy;
        self
    }

    async fn update_counts_once(&self, batch_id: &str, delta: BatchDelta) -> Result<BatchCountOutcome> {
        let mut tx = begin_immediate(&self.pool).await?;
        match update_counts_in_tx(&mut tx, batch_id, delta).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

/// New counters after applying `delta`: each floored at zero, and
/// `completed + failed + processing` never exceeding `total`.
pub(crate) fn apply_delta(
    total: i64,
    completed: i64,
    failed: i64,
    processing: i64,
    delta: BatchDelta,
) -> (i64, i64, i64) {
    let total = total.max(0);
    let completed = (completed + delta.completed).clamp(0, total);
    let failed = (failed + delta.failed).clamp(0, total - completed);
    let processing = (processing + delta.processing).clamp(0, total - completed - failed);
    (completed, failed, processing)
}

async fn update_counts_in_tx(
    conn: &mut SqliteConnection,
    batch_id: &str,
    delta: BatchDelta,
) -> Result<BatchCountOutcome> {
    let row = sqlx::query_as::<_, BatchDbModel>("SELECT * FROM batches WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("Batch", batch_id))?;

    let prior = BatchStatus::parse(&row.status).unwrap_or(BatchStatus::Pending);
    let (completed, failed, processing) = apply_delta(
        row.total_items,
        row.completed_items,
        row.failed_items,
        row.processing_items,
        delta,
    );

    let is_complete = completed + failed >= row.total_items;
    let newly_complete = is_complete && prior != BatchStatus::Complete;

    let status = if prior == BatchStatus::Complete || is_complete {
        BatchStatus::Complete
    } else if completed + failed + processing > 0 {
        BatchStatus::Processing
    } else {
        BatchStatus::Pending
    };

    let now = now_ms();
    let completed_at = if newly_complete { Some(now) } else { row.completed_at };

    sqlx::query(
        "UPDATE batches SET completed_items = ?, failed_items = ?, processing_items = ?, \
         status = ?, completed_at = ?, updated_at = ? WHERE batch_id = ?",
    )
    .bind(completed)
    .bind(failed)
    .bind(processing)
    .bind(status.as_str())
    .bind(completed_at)
    .bind(now)
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;

    let batch = Batch::try_from(BatchDbModel {
        completed_items: completed,
        failed_items: failed,
        processing_items: processing,
        status: status.as_str().to_string(),
        completed_at,
        updated_at: now,
        ..row
    })?;

    Ok(BatchCountOutcome {
        webhook_url: batch.webhook_url.clone(),
        should_fire_webhook: newly_complete,
        batch,
    })
}

pub(crate) async fn insert_batch(conn: &mut SqliteConnection, batch: &Batch) -> Result<()> {
    let metadata = match &batch.metadata {
        Value::Null => "{}".to_string(),
        other => serde_json::to_string(other)?,
    };
    sqlx::query(
        r#"
        INSERT INTO batches (
            batch_id, queue_name, total_items, completed_items, failed_items,
            processing_items, status, webhook_url, metadata, created_at, updated_at, completed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&batch.batch_id)
    .bind(&batch.queue_name)
    .bind(batch.total_items as i64)
    .bind(batch.completed_items as i64)
    .bind(batch.failed_items as i64)
    .bind(batch.processing_items as i64)
    .bind(batch.status.as_str())
    .bind(batch.webhook_url.as_deref())
    .bind(metadata)
    .bind(batch.created_at)
    .bind(batch.updated_at)
    .bind(batch.completed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl BatchRepository for SqlxBatchRepository {
    async fn create_batch(&self, batch: &Batch) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_batch(&mut conn, batch).await
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        let row = sqlx::query_as::<_, BatchDbModel>("SELECT * FROM batches WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Batch::try_from).transpose()
    }

    async fn update_counts(&self, batch_id: &str, delta: BatchDelta) -> Result<BatchCountOutcome> {
        retry_on_contention("update_batch_counts", &self.contention, || {
            self.update_counts_once(batch_id, delta)
        })
        .await
    }

    async fn list_stale(&self, updated_before: i64) -> Result<Vec<Batch>> {
        let rows = sqlx::query_as::<_, BatchDbModel>(
            "SELECT * FROM batches WHERE status != 'complete' AND updated_at < ? ORDER BY updated_at ASC",
        )
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Batch::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;

    fn batch(id: &str, total: u32) -> Batch {
        Batch {
            batch_id: id.to_string(),
            queue_name: "stability".to_string(),
            total_items: total,
            completed_items: 0,
            failed_items: 0,
            processing_items: 0,
            status: BatchStatus::Pending,
            webhook_url: Some("http://hooks.local/done".to_string()),
            metadata: serde_json::json!({"sku": "sku-1"}),
            created_at: 1,
            updated_at: 1,
            completed_at: None,
        }
    }

    #[test]
    fn test_apply_delta_floors_and_clamps() {
        assert_eq!(apply_delta(3, 0, 0, 0, BatchDelta::completed()), (1, 0, 0));
        assert_eq!(
            apply_delta(3, 0, 0, 0, BatchDelta { processing: -5, ..Default::default() }),
            (0, 0, 0)
        );
        assert_eq!(
            apply_delta(2, 2, 0, 0, BatchDelta { failed: 3, processing: 1, ..Default::default() }),
            (2, 0, 0)
        );
    }

    #[tokio::test]
    async fn test_counts_and_single_signal() {
        let repo = SqlxBatchRepository::new(init_memory_pool().await.unwrap());
        repo.create_batch(&batch("b1", 2)).await.unwrap();

        let out = repo.update_counts("b1", BatchDelta::claimed()).await.unwrap();
        assert_eq!(out.batch.status, BatchStatus::Processing);
        assert!(!out.should_fire_webhook);

        repo.update_counts("b1", BatchDelta::claimed()).await.unwrap();
        let out = repo.update_counts("b1", BatchDelta::completed()).await.unwrap();
        assert!(!out.should_fire_webhook);

        let out = repo.update_counts("b1", BatchDelta::failed()).await.unwrap();
        assert!(out.should_fire_webhook);
        assert_eq!(out.webhook_url.as_deref(), Some("http://hooks.local/done"));
        assert_eq!(out.batch.status, BatchStatus::Complete);
        assert_eq!(out.batch.completed_items, 1);
        assert_eq!(out.batch.failed_items, 1);
        assert_eq!(out.batch.processing_items, 0);
        assert!(out.batch.completed_at.is_some());

        // Further deltas keep it complete without re-signalling.
        let out = repo.update_counts("b1", BatchDelta::completed()).await.unwrap();
        assert!(!out.should_fire_webhook);
        assert_eq!(out.batch.status, BatchStatus::Complete);
        assert_eq!(out.batch.completed_items + out.batch.failed_items, 2);
    }

    #[tokio::test]
    async fn test_missing_batch_is_not_found() {
        let repo = SqlxBatchRepository::new(init_memory_pool().await.unwrap());
        let err = repo.update_counts("nope", BatchDelta::completed()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(repo.get_batch("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_stale() {
        let repo = SqlxBatchRepository::new(init_memory_pool().await.unwrap());
        repo.create_batch(&batch("old", 1)).await.unwrap();

        let stale = repo.list_stale(now_ms()).await.unwrap();
        assert_eq!(stale.len(), 1);

        repo.update_counts("old", BatchDelta::completed()).await.unwrap();
        assert!(repo.list_stale(now_ms() + 1000).await.unwrap().is_empty());
    }
}
