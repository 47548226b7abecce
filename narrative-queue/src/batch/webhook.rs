//! Batch completion delivery.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Result;
use crate::database::models::Batch;
use crate::utils::http_client::build_client;

/// Receives the completion signal of a batch. Called at most once per batch.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, url: &str, batch: &Batch) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Bearer token sent with every delivery.
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Extra headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bearer_token: None,
            headers: Vec::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// POSTs the batch document as JSON to the batch's `webhookUrl`.
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, client })
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        if let Some(token) = &self.config.bearer_token
            && let Ok(value) = format!("Bearer {}", token).parse()
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        headers
    }
}

#[async_trait]
impl CompletionNotifier for WebhookNotifier {
    async fn notify(&self, url: &str, batch: &Batch) -> Result<()> {
        debug!(batch_id = %batch.batch_id, url, "Delivering batch webhook");

        let response = self
            .client
            .post(url)
            .headers(self.build_headers())
            .json(batch)
            .send()
            .await
            .map_err(|e| crate::Error::Other(format!("Webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(batch_id = %batch.batch_id, %status, "Webhook delivery rejected");
            return Err(crate::Error::Other(format!(
                "Webhook failed: {} - {}",
                status, body
            )));
        }

        info!(batch_id = %batch.batch_id, "Batch webhook delivered");
        Ok(())
    }
}

/// Notifier that only logs. Used when outbound delivery is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl CompletionNotifier for LoggingNotifier {
    async fn notify(&self, url: &str, batch: &Batch) -> Result<()> {
        info!(
            batch_id = %batch.batch_id,
            url,
            completed = batch.completed_items,
            failed = batch.failed_items,
            "Batch complete (delivery disabled)"
        );
        Ok(())
    }
}
