#![allow(dead_code)]

use std::sync::Arc;

use narrative_queue::database::repositories::{
    SqlxBatchRepository, SqlxCatalogueRepository, SqlxQueueRepository,
};
use narrative_queue::database::{DbPool, init_pool_with_size, run_migrations};
use narrative_queue::queue::QueueService;
use tempfile::TempDir;

/// An on-disk WAL database in a temp dir, so concurrent connections really contend.
pub struct TestDb {
    pub pool: DbPool,
    pub queue: Arc<SqlxQueueRepository>,
    pub batches: Arc<SqlxBatchRepository>,
    pub catalogue: Arc<SqlxCatalogueRepository>,
    _dir: TempDir,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display());
        let pool = init_pool_with_size(&url, 8).await.unwrap();
        run_migrations(&pool).await.unwrap();

        Self {
            queue: Arc::new(SqlxQueueRepository::new(pool.clone())),
            batches: Arc::new(SqlxBatchRepository::new(pool.clone())),
            catalogue: Arc::new(SqlxCatalogueRepository::new(pool.clone())),
            pool,
            _dir: dir,
        }
    }

    pub fn service(&self) -> QueueService {
        QueueService::new(self.queue.clone(), self.batches.clone())
    }
}
