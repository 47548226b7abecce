//! Forwards transcription and book-import jobs to an internal service.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::http::{Headers, ProviderTransport, bearer};
use crate::config::ProviderConfig;
use crate::database::models::{EntryType, ProviderKind};
use crate::dispatch::{JobContext, PollConfig, PollStatus, ProviderError, ProviderHandler, poll_until};
use crate::queue::JobParams;
use crate::queue::params::is_supported;

type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// POSTs params to `{base}/{entryType}`. A response carrying `jobId` is
/// polled at `{base}/jobs/{jobId}` until the service reports an outcome.
pub struct ServiceCallHandler {
    provider: ProviderKind,
    config: ProviderConfig,
    transport: Arc<dyn ProviderTransport>,
    poll: PollConfig,
}

impl ServiceCallHandler {
    pub fn new(
        provider: ProviderKind,
        config: ProviderConfig,
        transport: Arc<dyn ProviderTransport>,
        poll: PollConfig,
    ) -> Self {
        Self {
            provider,
            config,
            transport,
            poll,
        }
    }

    fn headers(&self) -> Headers {
        self.config.api_key.as_deref().map(bearer).into_iter().collect()
    }
}

fn job_status(status: &Value) -> PollStatus<Value> {
    match status["status"].as_str() {
        Some("complete") | Some("completed") => {
            PollStatus::Completed(status.get("result").filter(|v| !v.is_null()).cloned())
        }
        Some("error") | Some("failed") => PollStatus::Failed(
            status["error"].as_str().unwrap_or("service job failed").to_string(),
        ),
        _ => PollStatus::Pending,
    }
}

#[async_trait]
impl ProviderHandler for ServiceCallHandler {
    fn name(&self) -> &'static str {
        match self.provider {
            ProviderKind::Transcription => "transcription-service",
            _ => "book-import-service",
        }
    }

    fn supports(&self, entry_type: EntryType) -> bool {
        is_supported(self.provider, entry_type)
    }

    async fn handle(&self, ctx: &JobContext) -> ProviderResult<Value> {
        let sku = match &ctx.params {
            JobParams::Transcribe(p) => p.sku.clone(),
            JobParams::Import(p) => p.sku.clone(),
            other => {
                return Err(ProviderError::InvalidParams(format!(
                    "{} cannot handle {}",
                    self.name(),
                    other.entry_type()
                )));
            }
        };
        let base = self
            .config
            .base_url
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured(format!("{} base URL", self.provider)))?;
        let headers = self.headers();
        let body = ctx
            .params
            .to_value()
            .map_err(|e| ProviderError::InvalidParams(e.to_string()))?;

        let entry_type = ctx.params.entry_type();
        let response = self
            .transport
            .post_json(&format!("{}/{}", base, entry_type.as_str()), &headers, &body)
            .await?;

        let output = match response["jobId"].as_str() {
            Some(job_id) => {
                debug!(entry_id = %ctx.entry_id(), job_id, "Service job accepted, polling");
                let status_url = format!("{}/jobs/{}", base, job_id);
                poll_until(&self.poll, |_| {
                    let status_url = status_url.clone();
                    let headers = headers.clone();
                    async move {
                        let status = self.transport.get_json(&status_url, &headers).await?;
                        Ok(job_status(&status))
                    }
                })
                .await?
            }
            None => response,
        };

        Ok(json!({
            "provider": self.provider.as_str(),
            "entryType": entry_type.as_str(),
            "sku": sku,
            "output": output,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::QueueEntry;
    use crate::dispatch::{Attempt, RetrySchedule};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct Service {
        accepted: Value,
        statuses: Mutex<VecDeque<Value>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProviderTransport for Service {
        async fn post_json(&self, url: &str, _headers: &Headers, _body: &Value) -> ProviderResult<Value> {
            self.calls.lock().push(url.to_string());
            Ok(self.accepted.clone())
        }

        async fn get_json(&self, url: &str, _headers: &Headers) -> ProviderResult<Value> {
            self.calls.lock().push(url.to_string());
            Ok(self.statuses.lock().pop_front().unwrap_or(json!({"status": "running"})))
        }

        async fn get_bytes(&self, _url: &str) -> ProviderResult<Bytes> {
            Ok(Bytes::new())
        }
    }

    fn handler(accepted: Value, statuses: Vec<Value>) -> (ServiceCallHandler, Arc<Service>) {
        let transport = Arc::new(Service {
            accepted,
            statuses: Mutex::new(statuses.into()),
            calls: Mutex::new(Vec::new()),
        });
        let config = ProviderConfig {
            base_url: Some("https://svc.local".into()),
            ..Default::default()
        };
        let poll = PollConfig {
            initial_delay_ms: 1,
            interval_ms: 1,
            max_attempts: 3,
        };
        (
            ServiceCallHandler::new(ProviderKind::Transcription, config, transport.clone(), poll),
            transport,
        )
    }

    fn ctx() -> JobContext {
        let params = json!({"sku": "b1", "chapter": 2, "audioPath": "audio/b1/2.mp3"});
        let typed = JobParams::parse(ProviderKind::Transcription, EntryType::Transcribe, &params).unwrap();
        JobContext::new(
            QueueEntry::new_pending("t-1", ProviderKind::Transcription, EntryType::Transcribe, params),
            typed,
            Attempt::first(&RetrySchedule::default()),
        )
    }

    #[tokio::test]
    async fn test_synchronous_response_is_passed_through() {
        let (handler, transport) = handler(json!({"words": 1200}), vec![]);
        let result = handler.handle(&ctx()).await.unwrap();
        assert_eq!(result["output"]["words"], 1200);
        assert_eq!(result["sku"], "b1");
        assert_eq!(*transport.calls.lock(), vec!["https://svc.local/transcribe".to_string()]);
    }

    #[tokio::test]
    async fn test_job_is_polled() {
        let (handler, transport) = handler(
            json!({"jobId": "j-7"}),
            vec![
                json!({"status": "running"}),
                json!({"status": "completed", "result": {"transcriptUrl": "https://t/1.json"}}),
            ],
        );
        let result = handler.handle(&ctx()).await.unwrap();
        assert_eq!(result["output"]["transcriptUrl"], "https://t/1.json");
        assert_eq!(transport.calls.lock()[1], "https://svc.local/jobs/j-7");
    }

    #[tokio::test]
    async fn test_job_timeout() {
        let (handler, _) = handler(json!({"jobId": "j-8"}), vec![]);
        let err = handler.handle(&ctx()).await.unwrap_err();
        assert!(matches!(err, ProviderError::PollTimeout { attempts: 3 }));
    }
}
