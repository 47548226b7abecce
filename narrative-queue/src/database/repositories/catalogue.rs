//! Catalogue repository.
//!
//! `graph_progress` is shared with other writers, so it is only ever changed
//! through `json_set`/`json_insert` on individual paths. Nothing here rewrites
//! the whole document.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use crate::database::begin_immediate;
use crate::database::models::{CatalogueDbModel, ProgressView};
use crate::database::retry::retry_on_contention;
use crate::database::time::now_ms;
use crate::domain::RetryPolicy;
use crate::Result;

/// One field-path write inside a progress merge.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressWrite {
    /// `json_set(graph_progress, path, value)`; `path` is rooted at the progress document.
    Field { path: &'static str, value: Value },
    GraphAvailable(bool),
}

impl ProgressWrite {
    pub fn field(path: &'static str, value: impl Into<Value>) -> Self {
        Self::Field {
            path,
            value: value.into(),
        }
    }
}

/// Computes the writes for a merge from the state read inside the transaction.
/// May run more than once if the transaction is retried.
pub type ProgressPlan<'a> = dyn Fn(&ProgressView) -> Result<Vec<ProgressWrite>> + Send + Sync + 'a;

/// Catalogue repository trait.
#[async_trait]
pub trait CatalogueRepository: Send + Sync {
    async fn get_progress(&self, sku: &str) -> Result<Option<ProgressView>>;
    /// Read-compute-write in one immediate transaction. A missing record is
    /// created as an empty skeleton first.
    async fn merge_progress(&self, sku: &str, plan: &ProgressPlan<'_>) -> Result<ProgressView>;
    /// Add `chapter` to `chapterProgress.completedChapters` if absent.
    async fn append_completed_chapter(&self, sku: &str, chapter: u32) -> Result<ProgressView>;
}

/// SQLx implementation of CatalogueRepository.
pub struct SqlxCatalogueRepository {
    pool: SqlitePool,
    contention: RetryPolicy,
}

impl SqlxCatalogueRepository {
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

    async fn merge_once(&self, sku: &str, plan: &ProgressPlan<'_>) -> Result<ProgressView> {
        let mut tx = begin_immediate(&self.pool).await?;
        match merge_in_tx(&mut tx, sku, plan).await {
            Ok(view) => {
                tx.commit().await?;
                Ok(view)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn append_once(&self, sku: &str, chapter: u32) -> Result<ProgressView> {
        let mut tx = begin_immediate(&self.pool).await?;
        match append_in_tx(&mut tx, sku, chapter).await {
            Ok(view) => {
                tx.commit().await?;
                Ok(view)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

async fn ensure_row(conn: &mut SqliteConnection, sku: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO catalogue (sku, graph_progress, updated_at) VALUES (?, '{}', ?)")
        .bind(sku)
        .bind(now_ms())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn fetch_view(conn: &mut SqliteConnection, sku: &str) -> Result<ProgressView> {
    let row = sqlx::query_as::<_, CatalogueDbModel>("SELECT * FROM catalogue WHERE sku = ?")
        .bind(sku)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(ProgressView::from).unwrap_or_else(|| ProgressView::pending(sku)))
}

async fn set_field(conn: &mut SqliteConnection, sku: &str, path: &str, value: &Value) -> Result<()> {
    sqlx::query(
        "UPDATE catalogue SET \
            graph_progress = json_set(CASE WHEN json_valid(graph_progress) THEN graph_progress ELSE '{}' END, ?, json(?)), \
            updated_at = ? \
         WHERE sku = ?",
    )
    .bind(path)
    .bind(serde_json::to_string(value)?)
    .bind(now_ms())
    .bind(sku)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn merge_in_tx(
    conn: &mut SqliteConnection,
    sku: &str,
    plan: &ProgressPlan<'_>,
) -> Result<ProgressView> {
    ensure_row(conn, sku).await?;
    let current = fetch_view(conn, sku).await?;

    for write in plan(&current)? {
        match write {
            ProgressWrite::Field { path, value } => set_field(conn, sku, path, &value).await?,
            ProgressWrite::GraphAvailable(flag) => {
                sqlx::query("UPDATE catalogue SET graph_available = ?, updated_at = ? WHERE sku = ?")
                    .bind(flag as i64)
                    .bind(now_ms())
                    .bind(sku)
                    .execute(&mut *conn)
                    .await?;
            }
        }
    }

    fetch_view(conn, sku).await
}

async fn append_in_tx(conn: &mut SqliteConnection, sku: &str, chapter: u32) -> Result<ProgressView> {
    ensure_row(conn, sku).await?;

    let present: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM catalogue, json_each(catalogue.graph_progress, '$.chapterProgress.completedChapters') \
         WHERE catalogue.sku = ? AND json_valid(catalogue.graph_progress) AND json_each.value = ?",
    )
    .bind(sku)
    .bind(chapter as i64)
    .fetch_one(&mut *conn)
    .await?;

    if present == 0 {
        sqlx::query(
            "UPDATE catalogue SET graph_progress = json_insert( \
                json_set(graph_progress, '$.chapterProgress.completedChapters', \
                    json(COALESCE(json_extract(graph_progress, '$.chapterProgress.completedChapters'), '[]'))), \
                '$.chapterProgress.completedChapters[#]', ?), \
             updated_at = ? \
             WHERE sku = ? AND json_valid(graph_progress)",
        )
        .bind(chapter as i64)
        .bind(now_ms())
        .bind(sku)
        .execute(&mut *conn)
        .await?;
    }

    fetch_view(conn, sku).await
}

#[async_trait]
impl CatalogueRepository for SqlxCatalogueRepository {
    async fn get_progress(&self, sku: &str) -> Result<Option<ProgressView>> {
        let row = sqlx::query_as::<_, CatalogueDbModel>("SELECT * FROM catalogue WHERE sku = ?")
            .bind(sku)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ProgressView::from))
    }

    async fn merge_progress(&self, sku: &str, plan: &ProgressPlan<'_>) -> Result<ProgressView> {
        retry_on_contention("merge_progress", &self.contention, || self.merge_once(sku, plan)).await
    }

    async fn append_completed_chapter(&self, sku: &str, chapter: u32) -> Result<ProgressView> {
        retry_on_contention("append_completed_chapter", &self.contention, || {
            self.append_once(sku, chapter)
        })
        .await
    }
}
