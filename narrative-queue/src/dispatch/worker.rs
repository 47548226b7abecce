//! Per-provider processing loop.

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::attempt::{Attempt, RetrySchedule, run_attempts};
use super::handler::{JobContext, ProviderHandler};
use super::rate_limiter::RateLimiterManager;
use crate::batch::BatchAggregator;
use crate::database::models::{EntryStatus, ProviderKind, QueueEntry};
use crate::database::repositories::BatchDelta;
use crate::queue::{JobParams, QueueService};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Entries claimed per round.
    pub claim_limit: u32,
    /// Handlers running at once within a round.
    pub concurrency: usize,
    /// Idle wait between rounds of the background loop.
    pub poll_interval: Duration,
    pub retry: RetrySchedule,
    /// Enqueue a `_retry` twin when retryable failures exhaust their attempts.
    pub requeue_failed: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            claim_limit: 10,
            concurrency: 4,
            poll_interval: Duration::from_secs(5),
            retry: RetrySchedule::default(),
            requeue_failed: true,
        }
    }
}

/// Counts for one or more claim rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub claimed: u32,
    pub completed: u32,
    pub failed: u32,
    /// Failures that were re-enqueued as a `_retry` twin. Also counted in `failed`.
    pub requeued: u32,
    /// Store writes (entry results or batch counters) that could not be applied.
    pub record_failures: u32,
}

impl RunSummary {
    pub fn merge(&mut self, other: RunSummary) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.requeued += other.requeued;
        self.record_failures += other.record_failures;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Completed,
    Failed,
    Requeued,
    /// Another writer already moved the entry out of `processing`.
    Lost,
}

/// Claims and processes entries of a single provider.
pub struct ProviderWorker {
    provider: ProviderKind,
    handler: Arc<dyn ProviderHandler>,
    queue: QueueService,
    aggregator: BatchAggregator,
    limiter: RateLimiterManager,
    config: WorkerConfig,
    wake: Notify,
}

impl ProviderWorker {
    pub fn new(
        provider: ProviderKind,
        handler: Arc<dyn ProviderHandler>,
        queue: QueueService,
        aggregator: BatchAggregator,
        limiter: RateLimiterManager,
        config: WorkerConfig,
    ) -> Self {
        Self {
            provider,
            handler,
            queue,
            aggregator,
            limiter,
            config,
            wake: Notify::new(),
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Wake the background loop. Stored if the loop is not currently waiting.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Claim one round of entries and process them.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let claimed = self
            .queue
            .queue()
            .claim_pending(self.provider, self.config.claim_limit)
            .await?;
        if claimed.is_empty() {
            return Ok(RunSummary::default());
        }

        info!(
            provider = %self.provider,
            handler = self.handler.name(),
            count = claimed.len(),
            "Claimed entries"
        );

        let mut summary = RunSummary {
            claimed: claimed.len() as u32,
            ..Default::default()
        };

        for entry in &claimed {
            if let Some(batch_id) = entry.batch_id.as_deref()
                && self.apply_batch_delta(batch_id, BatchDelta::claimed()).await.is_err()
            {
                summary.record_failures += 1;
            }
        }

        let outcomes: Vec<(String, Result<EntryOutcome>)> = stream::iter(claimed)
            .map(|entry| async move {
                let id = entry.id.clone();
                (id, self.process(entry).await)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (entry_id, outcome) in outcomes {
            match outcome {
                Ok(EntryOutcome::Completed) => summary.completed += 1,
                Ok(EntryOutcome::Failed) => summary.failed += 1,
                Ok(EntryOutcome::Requeued) => {
                    summary.failed += 1;
                    summary.requeued += 1;
                }
                Ok(EntryOutcome::Lost) => {}
                Err(e) => {
                    summary.record_failures += 1;
                    error!(provider = %self.provider, entry_id = %entry_id, "Failed to record outcome: {}", e);
                }
            }
        }

        Ok(summary)
    }

    /// Run rounds until a claim comes back empty or `token` is cancelled.
    pub async fn run_until_drained(&self, token: &CancellationToken) -> Result<RunSummary> {
        let mut total = RunSummary::default();
        while !token.is_cancelled() {
            let round = self.run_once().await?;
            if round.claimed == 0 {
                break;
            }
            total.merge(round);
        }
        Ok(total)
    }

    /// Background loop: drain, then wait for a wake-up, the poll interval or cancellation.
    pub async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        info!(provider = %self.provider, "Worker loop started");

        loop {
            if token.is_cancelled() {
                break;
            }

            match self.run_until_drained(&token).await {
                Ok(summary) if summary.claimed > 0 => {
                    info!(
                        provider = %self.provider,
                        claimed = summary.claimed,
                        completed = summary.completed,
                        failed = summary.failed,
                        requeued = summary.requeued,
                        record_failures = summary.record_failures,
                        "Queue drained"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(provider = %self.provider, "Worker round failed: {}", e);
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(provider = %self.provider, "Worker loop stopped");
    }

    async fn process(&self, entry: QueueEntry) -> Result<EntryOutcome> {
        let params = match JobParams::parse(entry.provider, entry.entry_type, &entry.params) {
            Ok(params) => params,
            Err(e) => {
                warn!(entry_id = %entry.id, "Claimed entry has invalid params: {}", e);
                return self.reject(&entry, &format!("invalid params: {}", e)).await;
            }
        };
        if !self.handler.supports(entry.entry_type) {
            let reason = format!(
                "handler {} does not support entry type {}",
                self.handler.name(),
                entry.entry_type
            );
            return self.reject(&entry, &reason).await;
        }

        let schedule = self.config.retry;
        let ctx = JobContext::new(entry.clone(), params, Attempt::first(&schedule));
        let mut trace = Vec::new();

        let result = run_attempts(&schedule, &mut trace, |attempt| {
            let ctx = ctx.with_attempt(attempt);
            async move {
                let waited = self.limiter.acquire(self.provider).await;
                if !waited.is_zero() {
                    debug!(entry_id = %ctx.entry.id, ?waited, "Waited for rate limit");
                }
                self.handler.handle(&ctx).await
            }
        })
        .await;

        match result {
            Ok((value, attempts)) => {
                if attempts > 1 {
                    trace.push(format!("completed on attempt {}", attempts));
                }
                let written = self
                    .finish(&entry, EntryStatus::Complete, &value, &trace)
                    .await?;
                if !written {
                    return Ok(EntryOutcome::Lost);
                }
                debug!(entry_id = %entry.id, attempts, "Entry complete");
                if let Some(batch_id) = entry.batch_id.as_deref() {
                    self.apply_batch_delta(batch_id, BatchDelta::completed()).await?;
                }
                Ok(EntryOutcome::Completed)
            }
            Err(failure) => {
                let content_filtered = failure.error.is_content_policy();
                let result = json!({
                    "error": failure.error.to_string(),
                    "contentFiltered": content_filtered,
                    "attempts": failure.attempts,
                    "class": failure.class.to_string(),
                });

                let mut twin = None;
                if failure.exhausted && self.config.requeue_failed && !entry.is_retry() {
                    match self.queue.requeue_retry(&entry).await {
                        Ok(Some(id)) => {
                            trace.push(format!("re-enqueued as {}", id));
                            twin = Some(id);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(entry_id = %entry.id, "Failed to re-enqueue: {}", e),
                    }
                }

                let written = self.finish(&entry, EntryStatus::Error, &result, &trace).await?;
                if !written {
                    return Ok(EntryOutcome::Lost);
                }
                warn!(
                    entry_id = %entry.id,
                    class = %failure.class,
                    content_filtered,
                    "Entry failed: {}",
                    failure.error
                );

                // The twin carries the batch id and reports its own outcome.
                let delta = if twin.is_some() {
                    BatchDelta {
                        processing: -1,
                        ..Default::default()
                    }
                } else {
                    BatchDelta::failed()
                };
                if let Some(batch_id) = entry.batch_id.as_deref() {
                    self.apply_batch_delta(batch_id, delta).await?;
                }

                Ok(if twin.is_some() {
                    EntryOutcome::Requeued
                } else {
                    EntryOutcome::Failed
                })
            }
        }
    }

    /// Fail an entry without calling the provider.
    async fn reject(&self, entry: &QueueEntry, reason: &str) -> Result<EntryOutcome> {
        let result = json!({
            "error": reason,
            "contentFiltered": false,
            "attempts": 0,
            "class": "terminal",
        });
        let written = self
            .finish(entry, EntryStatus::Error, &result, &[reason.to_string()])
            .await?;
        if !written {
            return Ok(EntryOutcome::Lost);
        }
        if let Some(batch_id) = entry.batch_id.as_deref() {
            self.apply_batch_delta(batch_id, BatchDelta::failed()).await?;
        }
        Ok(EntryOutcome::Failed)
    }

    /// Terminal write. Returns false if the entry already left `processing`.
    async fn finish(
        &self,
        entry: &QueueEntry,
        status: EntryStatus,
        result: &Value,
        lines: &[String],
    ) -> Result<bool> {
        let trace = compose_trace(&entry.trace, lines);
        match self
            .queue
            .queue()
            .finish_entry(&entry.id, status, result, &trace)
            .await
        {
            Ok(()) => Ok(true),
            Err(Error::InvalidStateTransition { from, .. }) => {
                warn!(entry_id = %entry.id, from = %from, "Entry left processing before its result was written");
                Ok(false)
            }
            Err(Error::NotFound { .. }) => {
                warn!(entry_id = %entry.id, "Entry deleted while processing");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_batch_delta(&self, batch_id: &str, delta: BatchDelta) -> Result<()> {
        match self.aggregator.apply(batch_id, delta).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(provider = %self.provider, batch_id, ?delta, "Failed to update batch counters: {}", e);
                Err(e)
            }
        }
    }
}

fn compose_trace(existing: &str, lines: &[String]) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(lines.len() + 1);
    if !existing.is_empty() {
        parts.push(existing);
    }
    parts.extend(lines.iter().map(String::as_str));
    parts.join("\n")
}
