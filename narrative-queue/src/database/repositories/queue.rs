//! Queue entry repository.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::database::models::{
    Batch, BatchStatus, EntryStatus, ProviderKind, QueueEntry, QueueEntryDbModel,
};
use crate::database::repositories::batch::insert_batch;
use crate::database::retry::retry_on_contention;
use crate::database::time::now_ms;
use crate::database::begin_immediate;
use crate::domain::RetryPolicy;
use crate::{Error, Result};

/// Default bound on a type/status scan.
pub const DEFAULT_SCAN_LIMIT: u32 = 100;

/// Lookup parameters as supplied by callers. Several may be set; only the
/// highest-priority one is used (id > batchId > params > type/status scan).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryQuery {
    pub id: Option<String>,
    pub batch_id: Option<String>,
    /// Params field to match, e.g. `sceneId` or `chapter`.
    pub param_field: Option<String>,
    pub param_value: Option<Value>,
    #[serde(rename = "type")]
    pub provider: Option<ProviderKind>,
    pub status: Option<EntryStatus>,
    pub limit: Option<u32>,
    pub time_requested_after: Option<i64>,
}

/// The single strategy a lookup resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryLookup {
    Id(String),
    Batch(String),
    Params { path: String, value: Value },
    Scan {
        provider: Option<ProviderKind>,
        status: Option<EntryStatus>,
        limit: u32,
        time_requested_after: Option<i64>,
    },
}

impl EntryQuery {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn by_batch(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: Some(batch_id.into()),
            ..Default::default()
        }
    }

    pub fn by_param(field: impl Into<String>, value: Value) -> Self {
        Self {
            param_field: Some(field.into()),
            param_value: Some(value),
            ..Default::default()
        }
    }

    pub fn scan(provider: ProviderKind, status: EntryStatus, limit: u32) -> Self {
        Self {
            provider: Some(provider),
            status: Some(status),
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Pick exactly one strategy.
    pub fn resolve(&self) -> Result<EntryLookup> {
        if let Some(id) = &self.id {
            return Ok(EntryLookup::Id(id.clone()));
        }
        if let Some(batch_id) = &self.batch_id {
            return Ok(EntryLookup::Batch(batch_id.clone()));
        }
        if let Some(field) = &self.param_field {
            let value = self
                .param_value
                .clone()
                .ok_or_else(|| Error::validation("paramField requires paramValue"))?;
            return Ok(EntryLookup::Params {
                path: params_path(field)?,
                value,
            });
        }
        Ok(EntryLookup::Scan {
            provider: self.provider,
            status: self.status,
            limit: self.limit.unwrap_or(DEFAULT_SCAN_LIMIT).max(1),
            time_requested_after: self.time_requested_after,
        })
    }
}

/// JSON path for a params field. Only plain identifiers separated by dots.
fn params_path(field: &str) -> Result<String> {
    let valid = !field.is_empty()
        && field
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if !valid {
        return Err(Error::validation(format!("Invalid params field '{}'", field)));
    }
    Ok(format!("$.{}", field))
}

/// One row of a bulk update. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryUpdate {
    pub id: String,
    pub status: Option<EntryStatus>,
    pub trace: Option<String>,
    pub result: Option<Value>,
    pub retry_count: Option<u32>,
    /// Override for `timeRequested`, e.g. to push an entry to the back of the queue.
    pub time_requested: Option<i64>,
}

fn status_rank(status: EntryStatus) -> u8 {
    match status {
        EntryStatus::Pending => 0,
        EntryStatus::Processing => 1,
        EntryStatus::Complete | EntryStatus::Error => 2,
    }
}

/// Queue repository trait.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Create-if-absent per entry. Returns the ids actually created.
    async fn add_entries(&self, entries: &[QueueEntry]) -> Result<Vec<String>>;
    /// Insert entries and their batch document in one transaction. The batch's
    /// `totalItems` is the number of entries actually created.
    async fn add_batch(&self, batch: Batch, entries: &[QueueEntry]) -> Result<(Batch, Vec<String>)>;
    async fn get_entries(&self, query: &EntryQuery) -> Result<Vec<QueueEntry>>;
    async fn get_entry(&self, id: &str) -> Result<Option<QueueEntry>>;
    /// Apply every update in one transaction. Returns the number of rows changed.
    async fn update_entries(&self, updates: &[EntryUpdate]) -> Result<u64>;
    async fn delete_entries(&self, ids: &[String]) -> Result<u64>;
    async fn nuke(&self) -> Result<u64>;
    /// Atomically move up to `limit` pending entries of `provider` to processing.
    async fn claim_pending(&self, provider: ProviderKind, limit: u32) -> Result<Vec<QueueEntry>>;
    /// Terminal write, only from `processing`.
    async fn finish_entry(
        &self,
        id: &str,
        status: EntryStatus,
        result: &Value,
        trace: &str,
    ) -> Result<()>;
    /// Processing entries claimed before `started_before` (epoch ms).
    async fn list_stuck(&self, started_before: i64) -> Result<Vec<QueueEntry>>;
    /// Append `marker` to the trace of a still-processing entry. Status is untouched.
    async fn append_trace(&self, id: &str, marker: &str) -> Result<bool>;
}

/// SQLx implementation of QueueRepository.
pub struct SqlxQueueRepository {
    pool: SqlitePool,
    contention: RetryPolicy,
}

impl SqlxQueueRepository {
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

    async fn claim_once(&self, provider: ProviderKind, limit: u32) -> Result<Vec<QueueEntry>> {
        let mut tx = begin_immediate(&self.pool).await?;
        match claim_in_tx(&mut tx, provider, limit).await {
            Ok(entries) => {
                tx.commit().await?;
                Ok(entries)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

async fn claim_in_tx(
    conn: &mut SqliteConnection,
    provider: ProviderKind,
    limit: u32,
) -> Result<Vec<QueueEntry>> {
    let rows = sqlx::query_as::<_, QueueEntryDbModel>(
        "SELECT * FROM queue_entries WHERE queue_type = ? AND status = 'pending' \
         ORDER BY time_requested ASC, id ASC LIMIT ?",
    )
    .bind(provider.as_str())
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;

    let now = now_ms();
    let mut claimed = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id.clone();
        let mut entry = match QueueEntry::try_from(row) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(entry_id = %id, "Unreadable pending entry marked as error: {}", e);
                fail_unreadable(conn, &id, &e, now).await?;
                continue;
            }
        };

        let res = sqlx::query(
            "UPDATE queue_entries SET status = 'processing', processing_started = ?, time_updated = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(now)
        .bind(&entry.id)
        .execute(&mut *conn)
        .await?;

        if res.rows_affected() != 1 {
            return Err(Error::Other(format!(
                "Claimed entry {} changed inside the claim transaction",
                entry.id
            )));
        }
        entry.status = EntryStatus::Processing;
        entry.processing_started = Some(now);
        entry.time_updated = now;
        claimed.push(entry);
    }

    Ok(claimed)
}

/// Terminal error for a pending row that cannot be decoded, so it never
/// blocks the head of its queue.
async fn fail_unreadable(conn: &mut SqliteConnection, id: &str, cause: &Error, now: i64) -> Result<()> {
    let result = serde_json::json!({
        "error": cause.to_string(),
        "contentFiltered": false,
        "attempts": 0,
        "class": "terminal",
    });
    sqlx::query(
        "UPDATE queue_entries SET status = 'error', result = ?, \
            trace = CASE WHEN trace = '' THEN ? ELSE trace || char(10) || ? END, time_updated = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(result.to_string())
    .bind(cause.to_string())
    .bind(cause.to_string())
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Create-if-absent. Returns whether a row was inserted.
async fn insert_entry(conn: &mut SqliteConnection, entry: &QueueEntry) -> Result<bool> {
    let params = serde_json::to_string(&entry.params)?;
    let result = entry.result.as_ref().map(serde_json::to_string).transpose()?;
    let res = sqlx::query(
        r#"
        INSERT INTO queue_entries (
            id, queue_type, entry_type, params, status, trace, result,
            retry_count, time_requested, time_updated, processing_started, batch_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&entry.id)
    .bind(entry.provider.as_str())
    .bind(entry.entry_type.as_str())
    .bind(params)
    .bind(entry.status.as_str())
    .bind(&entry.trace)
    .bind(result)
    .bind(entry.retry_count as i64)
    .bind(entry.time_requested)
    .bind(entry.time_updated)
    .bind(entry.processing_started)
    .bind(entry.batch_id.as_deref())
    .execute(&mut *conn)
    .await?;

    if res.rows_affected() == 0 {
        debug!(entry_id = %entry.id, "Entry already exists, skipped");
    }
    Ok(res.rows_affected() == 1)
}

async fn current_status(conn: &mut SqliteConnection, id: &str) -> Result<Option<String>> {
    let status = sqlx::query_scalar::<_, String>("SELECT status FROM queue_entries WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(status)
}

async fn apply_updates(conn: &mut SqliteConnection, updates: &[EntryUpdate]) -> Result<u64> {
    let now = now_ms();
    let mut changed = 0;
    for update in updates {
        if let Some(next) = update.status {
            let Some(current) = current_status(conn, &update.id).await? else {
                continue;
            };
            let current = EntryStatus::parse(&current)
                .ok_or_else(|| Error::validation(format!("Unknown status '{}'", current)))?;
            if status_rank(next) < status_rank(current) {
                return Err(Error::InvalidStateTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }
        }

        let result = update.result.as_ref().map(serde_json::to_string).transpose()?;
        let res = sqlx::query(
            "UPDATE queue_entries SET \
                status = COALESCE(?, status), \
                trace = COALESCE(?, trace), \
                result = COALESCE(?, result), \
                retry_count = COALESCE(?, retry_count), \
                time_requested = COALESCE(?, time_requested), \
                time_updated = ? \
             WHERE id = ?",
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.trace.as_deref())
        .bind(result)
        .bind(update.retry_count.map(|c| c as i64))
        .bind(update.time_requested)
        .bind(now)
        .bind(&update.id)
        .execute(&mut *conn)
        .await?;
        changed += res.rows_affected();
    }
    Ok(changed)
}

#[async_trait]
impl QueueRepository for SqlxQueueRepository {
    async fn add_entries(&self, entries: &[QueueEntry]) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(entries.len());
        for entry in entries {
            if insert_entry(&mut tx, entry).await? {
                created.push(entry.id.clone());
            }
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn add_batch(&self, batch: Batch, entries: &[QueueEntry]) -> Result<(Batch, Vec<String>)> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(entries.len());
        for entry in entries {
            if insert_entry(&mut tx, entry).await? {
                created.push(entry.id.clone());
            }
        }

        let mut batch = batch;
        batch.total_items = created.len() as u32;
        if created.is_empty() {
            batch.status = BatchStatus::Complete;
            batch.completed_at = Some(batch.created_at);
        }
        insert_batch(&mut tx, &batch).await?;

        tx.commit().await?;
        Ok((batch, created))
    }

    async fn get_entries(&self, query: &EntryQuery) -> Result<Vec<QueueEntry>> {
        let rows = match query.resolve()? {
            EntryLookup::Id(id) => {
                sqlx::query_as::<_, QueueEntryDbModel>("SELECT * FROM queue_entries WHERE id = ?")
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await?
            }
            EntryLookup::Batch(batch_id) => {
                sqlx::query_as::<_, QueueEntryDbModel>(
                    "SELECT * FROM queue_entries WHERE batch_id = ? ORDER BY time_requested ASC, id ASC",
                )
                .bind(batch_id)
                .fetch_all(&self.pool)
                .await?
            }
            EntryLookup::Params { path, value } => {
                // json_extract yields SQL scalars; compare against the same representation.
                let sql = match &value {
                    Value::String(_) => {
                        "SELECT * FROM queue_entries WHERE json_valid(params) AND json_extract(params, ?) = ? \
                         ORDER BY time_requested ASC, id ASC"
                    }
                    _ => {
                        "SELECT * FROM queue_entries WHERE json_valid(params) AND json_extract(params, ?) = json_extract(?, '$') \
                         ORDER BY time_requested ASC, id ASC"
                    }
                };
                let bound = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                sqlx::query_as::<_, QueueEntryDbModel>(sql)
                    .bind(path)
                    .bind(bound)
                    .fetch_all(&self.pool)
                    .await?
            }
            EntryLookup::Scan {
                provider,
                status,
                limit,
                time_requested_after,
            } => {
                sqlx::query_as::<_, QueueEntryDbModel>(
                    "SELECT * FROM queue_entries \
                     WHERE (? IS NULL OR queue_type = ?) \
                       AND (? IS NULL OR status = ?) \
                       AND (? IS NULL OR time_requested > ?) \
                     ORDER BY time_requested ASC, id ASC LIMIT ?",
                )
                .bind(provider.map(|p| p.as_str()))
                .bind(provider.map(|p| p.as_str()))
                .bind(status.map(|s| s.as_str()))
                .bind(status.map(|s| s.as_str()))
                .bind(time_requested_after)
                .bind(time_requested_after)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    async fn get_entry(&self, id: &str) -> Result<Option<QueueEntry>> {
        Ok(self.get_entries(&EntryQuery::by_id(id)).await?.into_iter().next())
    }

    async fn update_entries(&self, updates: &[EntryUpdate]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let changed = apply_updates(&mut tx, updates).await?;
        tx.commit().await?;
        Ok(changed)
    }

    async fn delete_entries(&self, ids: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for id in ids {
            deleted += sqlx::query("DELETE FROM queue_entries WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    async fn nuke(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM queue_entries")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn claim_pending(&self, provider: ProviderKind, limit: u32) -> Result<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        retry_on_contention("claim_pending", &self.contention, || {
            self.claim_once(provider, limit)
        })
        .await
    }

    async fn finish_entry(
        &self,
        id: &str,
        status: EntryStatus,
        result: &Value,
        trace: &str,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: EntryStatus::Processing.to_string(),
                to: status.to_string(),
            });
        }

        let res = sqlx::query(
            "UPDATE queue_entries SET status = ?, result = ?, trace = ?, time_updated = ? \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(result)?)
        .bind(trace)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            return Ok(());
        }

        let current = sqlx::query_scalar::<_, String>("SELECT status FROM queue_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match current {
            Some(from) => Err(Error::InvalidStateTransition {
                from,
                to: status.to_string(),
            }),
            None => Err(Error::not_found("QueueEntry", id)),
        }
    }

    async fn list_stuck(&self, started_before: i64) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query_as::<_, QueueEntryDbModel>(
            "SELECT * FROM queue_entries WHERE status = 'processing' \
             AND processing_started IS NOT NULL AND processing_started < ? \
             ORDER BY processing_started ASC",
        )
        .bind(started_before)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    async fn append_trace(&self, id: &str, marker: &str) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE queue_entries SET \
                trace = CASE WHEN trace = '' THEN ? ELSE trace || char(10) || ? END, \
                time_updated = ? \
             WHERE id = ? AND status = 'processing' AND instr(trace, ?) = 0",
        )
        .bind(marker)
        .bind(marker)
        .bind(now_ms())
        .bind(id)
        .bind(marker)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;
    use crate::database::models::EntryType;
    use serde_json::json;

    fn entry(id: &str, provider: ProviderKind, requested: i64) -> QueueEntry {
        let mut e = QueueEntry::new_pending(
            id,
            provider,
            EntryType::Generate,
            json!({"sceneId": id, "chapter": 0, "sceneNumber": 1, "prompt": "a lighthouse"}),
        );
        e.time_requested = requested;
        e
    }

    async fn repo() -> SqlxQueueRepository {
        SqlxQueueRepository::new(init_memory_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_add_entries_is_create_if_absent() {
        let repo = repo().await;
        let first = repo
            .add_entries(&[entry("a", ProviderKind::Stability, 1)])
            .await
            .unwrap();
        assert_eq!(first, vec!["a".to_string()]);

        let second = repo
            .add_entries(&[entry("a", ProviderKind::Stability, 2), entry("b", ProviderKind::Stability, 3)])
            .await
            .unwrap();
        assert_eq!(second, vec!["b".to_string()]);

        let stored = repo.get_entry("a").await.unwrap().unwrap();
        assert_eq!(stored.time_requested, 1);
    }

    #[tokio::test]
    async fn test_lookup_priority() {
        let repo = repo().await;
        let mut batched = entry("a", ProviderKind::Stability, 1);
        batched.batch_id = Some("batch-1".to_string());
        repo.add_entries(&[batched, entry("b", ProviderKind::Stability, 2)])
            .await
            .unwrap();

        // id wins over batchId
        let query = EntryQuery {
            id: Some("b".to_string()),
            batch_id: Some("batch-1".to_string()),
            ..Default::default()
        };
        let found = repo.get_entries(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "b");

        let by_batch = repo.get_entries(&EntryQuery::by_batch("batch-1")).await.unwrap();
        assert_eq!(by_batch.len(), 1);
        assert_eq!(by_batch[0].id, "a");
    }

    #[tokio::test]
    async fn test_params_lookup() {
        let repo = repo().await;
        repo.add_entries(&[entry("a", ProviderKind::Dalle, 1), entry("b", ProviderKind::Dalle, 2)])
            .await
            .unwrap();

        let by_scene = repo
            .get_entries(&EntryQuery::by_param("sceneId", json!("b")))
            .await
            .unwrap();
        assert_eq!(by_scene.len(), 1);
        assert_eq!(by_scene[0].id, "b");

        let by_chapter = repo
            .get_entries(&EntryQuery::by_param("chapter", json!(0)))
            .await
            .unwrap();
        assert_eq!(by_chapter.len(), 2);

        assert!(EntryQuery::by_param("x') OR 1=1 --", json!(1)).resolve().is_err());
    }

    #[tokio::test]
    async fn test_scan_orders_and_limits() {
        let repo = repo().await;
        repo.add_entries(&[
            entry("late", ProviderKind::Modal, 30),
            entry("early", ProviderKind::Modal, 10),
            entry("mid", ProviderKind::Modal, 20),
            entry("other", ProviderKind::Dalle, 5),
        ])
        .await
        .unwrap();

        let found = repo
            .get_entries(&EntryQuery::scan(ProviderKind::Modal, EntryStatus::Pending, 2))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "mid"]);

        let after = repo
            .get_entries(&EntryQuery {
                provider: Some(ProviderKind::Modal),
                time_requested_after: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = after.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["mid", "late"]);
    }

    #[tokio::test]
    async fn test_claim_is_ordered_and_bounded() {
        let repo = repo().await;
        repo.add_entries(&[
            entry("c", ProviderKind::Wavespeed, 3),
            entry("a", ProviderKind::Wavespeed, 1),
            entry("b", ProviderKind::Wavespeed, 2),
        ])
        .await
        .unwrap();

        let claimed = repo.claim_pending(ProviderKind::Wavespeed, 2).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(claimed.iter().all(|e| e.status == EntryStatus::Processing));
        assert!(claimed.iter().all(|e| e.processing_started.is_some()));

        let rest = repo.claim_pending(ProviderKind::Wavespeed, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "c");

        assert!(repo.claim_pending(ProviderKind::Wavespeed, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_fails_unreadable_rows_and_claims_the_rest() {
        let repo = repo().await;
        repo.add_entries(&[entry("good", ProviderKind::Wavespeed, 2)])
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO queue_entries (id, queue_type, entry_type, params, status, trace, \
             retry_count, time_requested, time_updated) \
             VALUES ('bad', 'wavespeed', 'hologram', '{}', 'pending', '', 0, 1, 1)",
        )
        .execute(&repo.pool)
        .await
        .unwrap();

        let claimed = repo.claim_pending(ProviderKind::Wavespeed, 10).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["good"]);

        let (status, result): (String, Option<String>) =
            sqlx::query_as("SELECT status, result FROM queue_entries WHERE id = 'bad'")
                .fetch_one(&repo.pool)
                .await
                .unwrap();
        assert_eq!(status, "error");
        let result: Value = serde_json::from_str(&result.unwrap()).unwrap();
        assert!(result["error"].as_str().unwrap().contains("hologram"));

        let good = repo.get_entry("good").await.unwrap().unwrap();
        assert_eq!(good.status, EntryStatus::Processing);
        assert!(repo.claim_pending(ProviderKind::Wavespeed, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_entry_is_guarded() {
        let repo = repo().await;
        repo.add_entries(&[entry("a", ProviderKind::Stability, 1)])
            .await
            .unwrap();

        // Not claimed yet.
        let err = repo
            .finish_entry("a", EntryStatus::Complete, &json!({}), "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        repo.claim_pending(ProviderKind::Stability, 1).await.unwrap();
        repo.finish_entry("a", EntryStatus::Complete, &json!({"url": "u"}), "done")
            .await
            .unwrap();

        // A duplicate terminal write is rejected.
        let err = repo
            .finish_entry("a", EntryStatus::Error, &json!({}), "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        let stored = repo.get_entry("a").await.unwrap().unwrap();
        assert_eq!(stored.status, EntryStatus::Complete);
        assert_eq!(stored.result, Some(json!({"url": "u"})));

        let missing = repo
            .finish_entry("nope", EntryStatus::Complete, &json!({}), "")
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_entries_partial_fields() {
        let repo = repo().await;
        repo.add_entries(&[entry("a", ProviderKind::Stability, 1), entry("b", ProviderKind::Stability, 2)])
            .await
            .unwrap();

        let changed = repo
            .update_entries(&[
                EntryUpdate {
                    id: "a".to_string(),
                    trace: Some("checked".to_string()),
                    ..Default::default()
                },
                EntryUpdate {
                    id: "b".to_string(),
                    retry_count: Some(1),
                    time_requested: Some(99),
                    ..Default::default()
                },
            ])
            .await
            .unwrap();
        assert_eq!(changed, 2);

        let a = repo.get_entry("a").await.unwrap().unwrap();
        assert_eq!(a.trace, "checked");
        assert_eq!(a.status, EntryStatus::Pending);
        let b = repo.get_entry("b").await.unwrap().unwrap();
        assert_eq!(b.retry_count, 1);
        assert_eq!(b.time_requested, 99);
    }

    #[tokio::test]
    async fn test_update_entries_rejects_backward_status() {
        let repo = repo().await;
        repo.add_entries(&[entry("a", ProviderKind::Stability, 1)])
            .await
            .unwrap();
        repo.claim_pending(ProviderKind::Stability, 1).await.unwrap();

        let err = repo
            .update_entries(&[EntryUpdate {
                id: "a".to_string(),
                status: Some(EntryStatus::Pending),
                ..Default::default()
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_delete_and_nuke() {
        let repo = repo().await;
        repo.add_entries(&[
            entry("a", ProviderKind::Stability, 1),
            entry("b", ProviderKind::Stability, 2),
            entry("c", ProviderKind::Stability, 3),
        ])
        .await
        .unwrap();

        let deleted = repo
            .delete_entries(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.nuke().await.unwrap(), 2);
        assert!(repo.get_entry("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stuck_entries_get_marker_once() {
        let repo = repo().await;
        repo.add_entries(&[entry("a", ProviderKind::Stability, 1)])
            .await
            .unwrap();
        repo.claim_pending(ProviderKind::Stability, 1).await.unwrap();

        let stuck = repo.list_stuck(now_ms() + 1000).await.unwrap();
        assert_eq!(stuck.len(), 1);

        assert!(repo.append_trace("a", "[stuck]").await.unwrap());
        assert!(!repo.append_trace("a", "[stuck]").await.unwrap());

        let a = repo.get_entry("a").await.unwrap().unwrap();
        assert_eq!(a.trace, "[stuck]");
        assert_eq!(a.status, EntryStatus::Processing);
    }
}
