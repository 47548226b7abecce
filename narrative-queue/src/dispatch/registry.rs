//! Worker host: one background loop per provider.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::worker::{ProviderWorker, RunSummary};
use crate::database::models::ProviderKind;
use crate::{Error, Result};

/// How a launch request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum LaunchOutcome {
    /// The background loop was already running and has been woken.
    Woken,
    /// A one-off drain was spawned.
    Spawned,
    /// The queue was drained before returning.
    Completed(RunSummary),
}

pub struct Dispatcher {
    workers: HashMap<ProviderKind, Arc<ProviderWorker>>,
    running: Mutex<HashSet<ProviderKind>>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl Dispatcher {
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self {
            workers: HashMap::new(),
            running: Mutex::new(HashSet::new()),
            cancellation_token,
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn register(&mut self, worker: ProviderWorker) {
        self.workers.insert(worker.provider(), Arc::new(worker));
    }

    pub fn worker(&self, provider: ProviderKind) -> Result<&Arc<ProviderWorker>> {
        self.workers
            .get(&provider)
            .ok_or_else(|| Error::not_found("ProviderWorker", provider.as_str()))
    }

    pub fn providers(&self) -> Vec<ProviderKind> {
        let mut providers: Vec<_> = self.workers.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }

    pub fn is_running(&self, provider: ProviderKind) -> bool {
        self.running.lock().contains(&provider)
    }

    /// Start the background loop of `provider`. No-op if it is already running.
    pub fn start(&self, provider: ProviderKind) -> Result<()> {
        let worker = self.worker(provider)?.clone();
        if !self.running.lock().insert(provider) {
            debug!(%provider, "Worker loop already running");
            return Ok(());
        }

        let token = self.cancellation_token.child_token();
        if let Err(e) = self.spawn(async move { worker.run_loop(token).await }) {
            self.running.lock().remove(&provider);
            return Err(e);
        }
        Ok(())
    }

    /// Kick `provider`. Wakes the running loop, or drains the queue once.
    ///
    /// With `wait` the queue is drained on the caller's task, even if a loop
    /// is running. Claims are exclusive so the two never process the same entry.
    pub async fn launch(&self, provider: ProviderKind, wait: bool) -> Result<LaunchOutcome> {
        let worker = self.worker(provider)?.clone();

        if wait {
            let summary = worker.run_until_drained(&self.cancellation_token).await?;
            return Ok(LaunchOutcome::Completed(summary));
        }

        if self.is_running(provider) {
            worker.wake();
            return Ok(LaunchOutcome::Woken);
        }

        let token = self.cancellation_token.child_token();
        self.spawn(async move {
            match worker.run_until_drained(&token).await {
                Ok(summary) => info!(
                    provider = %worker.provider(),
                    claimed = summary.claimed,
                    completed = summary.completed,
                    failed = summary.failed,
                    "One-off drain finished"
                ),
                Err(e) => error!(provider = %worker.provider(), "One-off drain failed: {}", e),
            }
        })?;
        Ok(LaunchOutcome::Spawned)
    }

    fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return Err(Error::Other("dispatcher is shut down".to_string()));
        };
        // Reap finished one-off drains.
        while join_set.try_join_next().is_some() {}
        join_set.spawn(task);
        Ok(())
    }

    /// Cancel every loop and wait for in-flight rounds to finish.
    pub async fn shutdown(&self) {
        info!("Stopping dispatcher");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }
        self.running.lock().clear();

        info!("Dispatcher stopped");
    }
}
