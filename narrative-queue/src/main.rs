use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use narrative_queue::api::{ApiServer, AppState};
use narrative_queue::batch::{BatchAggregator, CompletionNotifier, LoggingNotifier, WebhookNotifier};
use narrative_queue::checkup::Checkup;
use narrative_queue::config::EngineConfig;
use narrative_queue::database::{self, models::ProviderKind};
use narrative_queue::database::repositories::{
    SqlxBatchRepository, SqlxCatalogueRepository, SqlxQueueRepository,
};
use narrative_queue::dispatch::{Dispatcher, ProviderWorker};
use narrative_queue::logging::init_logging;
use narrative_queue::progress::ProgressTracker;
use narrative_queue::providers::{HandlerDeps, HttpTransport, LocalObjectStore, MediaUploader, build_handler};
use narrative_queue::queue::QueueService;
use narrative_queue::utils::http_client::build_client;

/// Outbound provider request timeout. Image generation can be slow.
const PROVIDER_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

const CHECKUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = EngineConfig::from_env_or_default();

    let (logging, _log_guard) = init_logging(&config.logging).context("failed to initialize logging")?;

    let pool = database::init_pool_with_size(&config.database_url, config.database_max_connections)
        .await
        .context("failed to open database")?;
    database::run_migrations(&pool).await?;

    let queue_repo = Arc::new(
        SqlxQueueRepository::new(pool.clone()).with_contention_policy(config.contention.clone()),
    );
    let batch_repo = Arc::new(
        SqlxBatchRepository::new(pool.clone()).with_contention_policy(config.contention.clone()),
    );
    let catalogue_repo = Arc::new(
        SqlxCatalogueRepository::new(pool.clone()).with_contention_policy(config.contention.clone()),
    );

    let queue = QueueService::new(queue_repo.clone(), batch_repo.clone());

    let notifier: Arc<dyn CompletionNotifier> = match WebhookNotifier::new(config.webhook.clone()) {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            warn!("Webhook delivery unavailable, batch completions will only be logged: {}", e);
            Arc::new(LoggingNotifier)
        }
    };
    let aggregator = BatchAggregator::new(batch_repo.clone(), notifier);

    let storage = &config.storage;
    let deps = HandlerDeps {
        transport: Arc::new(HttpTransport::new(build_client(PROVIDER_REQUEST_TIMEOUT)?)),
        uploader: MediaUploader::new(
            Arc::new(LocalObjectStore::new(
                "durable",
                &storage.durable_root,
                &storage.durable_base_url,
            )),
            Arc::new(LocalObjectStore::new("cdn", &storage.cdn_root, &storage.cdn_base_url)),
        ),
        poll: config.dispatch.poll,
    };

    let cancel_token = CancellationToken::new();
    let limiter = config.rate_limiter();
    let mut dispatcher = Dispatcher::new(cancel_token.child_token());
    for provider in ProviderKind::iter() {
        let handler = build_handler(provider, config.dispatch.mode, &config.provider(provider), &deps);
        dispatcher.register(ProviderWorker::new(
            provider,
            handler,
            queue.clone(),
            aggregator.clone(),
            limiter.clone(),
            config.dispatch.worker.clone(),
        ));
    }
    let dispatcher = Arc::new(dispatcher);

    for provider in &config.dispatch.autostart {
        if let Err(e) = dispatcher.start(*provider) {
            error!(%provider, "Failed to start worker: {}", e);
        }
    }

    let tracker = ProgressTracker::new(catalogue_repo, config.weights.clone());
    let checkup = Checkup::new(queue_repo, batch_repo, config.checkup_stuck_after);
    spawn_checkup(checkup.clone(), cancel_token.child_token());
    logging.start_retention_cleanup(cancel_token.child_token());

    let state = AppState::new(queue, dispatcher.clone(), tracker, checkup)
        .with_admin_token(config.admin_token.clone())
        .with_logging(logging);
    if state.admin_token.is_none() {
        warn!("ADMIN_TOKEN is not set, administrative routes are disabled");
    }

    let server = ApiServer::new(config.api.clone(), state, cancel_token.child_token())
        .with_static_dir("/media", &storage.durable_root)
        .with_static_dir("/cdn", &storage.cdn_root);

    info!(
        mode = %config.dispatch.mode,
        providers = dispatcher.providers().len(),
        "narrative-queue started"
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("API server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    cancel_token.cancel();
    dispatcher.shutdown().await;
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}

fn spawn_checkup(checkup: Checkup, cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CHECKUP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = checkup.run().await {
                        warn!("Checkup failed: {}", e);
                    }
                }
            }
        }
    });
}
