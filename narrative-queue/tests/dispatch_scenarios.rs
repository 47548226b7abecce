//! End-to-end dispatch through a live text handler over a scripted transport.

mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use narrative_queue::batch::{BatchAggregator, LoggingNotifier};
use narrative_queue::config::ProviderConfig;
use narrative_queue::database::models::{EntryStatus, EntryType, ProviderKind};
use narrative_queue::database::repositories::{EntryQuery, QueueRepository};
use narrative_queue::dispatch::{
    ProviderError, ProviderWorker, RateLimiterManager, RetrySchedule, WorkerConfig,
};
use narrative_queue::providers::{Headers, ProviderTransport, TextGenerationHandler};
use narrative_queue::queue::{NewEntry, QueueService};
use parking_lot::Mutex;
use serde_json::{Value, json};

use common::TestDb;

type Reply = Result<Value, ProviderError>;

/// Answers POSTs from a script, one reply per call.
struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    posts: Mutex<usize>,
}

impl ScriptedTransport {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            posts: Mutex::new(0),
        })
    }

    fn posts(&self) -> usize {
        *self.posts.lock()
    }
}

#[async_trait]
impl ProviderTransport for ScriptedTransport {
    async fn post_json(&self, _url: &str, _headers: &Headers, _body: &Value) -> Reply {
        *self.posts.lock() += 1;
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Network("script exhausted".into())))
    }

    async fn get_json(&self, _url: &str, _headers: &Headers) -> Reply {
        Err(ProviderError::Network("unexpected GET".into()))
    }

    async fn get_bytes(&self, _url: &str) -> Result<Bytes, ProviderError> {
        Err(ProviderError::Network("unexpected download".into()))
    }
}

fn worker(service: &QueueService, db: &TestDb, transport: Arc<ScriptedTransport>) -> ProviderWorker {
    let mut config = ProviderConfig::defaults_for(ProviderKind::OpenAi);
    config.api_key = Some("sk-test".into());

    ProviderWorker::new(
        ProviderKind::OpenAi,
        Arc::new(TextGenerationHandler::new(ProviderKind::OpenAi, config, transport)),
        service.clone(),
        BatchAggregator::new(db.batches.clone(), Arc::new(LoggingNotifier)),
        RateLimiterManager::new(),
        WorkerConfig {
            retry: RetrySchedule {
                max_attempts: 2,
                transient_backoff: Duration::from_millis(20),
            },
            requeue_failed: false,
            ..Default::default()
        },
    )
}

async fn enqueue_one(service: &QueueService, prompt: &str) -> String {
    let outcome = service
        .enqueue(&[NewEntry::new(
            ProviderKind::OpenAi,
            EntryType::Completion,
            json!({"prompt": prompt}),
        )])
        .await
        .unwrap();
    outcome.created[0].clone()
}

#[tokio::test]
async fn test_server_errors_retry_once_then_fail() {
    let db = TestDb::new().await;
    let service = db.service();
    let id = enqueue_one(&service, "describe the harbour").await;

    let transport = ScriptedTransport::new(vec![
        Err(ProviderError::from_status(500, "upstream exploded")),
        Err(ProviderError::from_status(500, "upstream exploded")),
    ]);
    let summary = worker(&service, &db, transport.clone()).run_once().await.unwrap();

    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(transport.posts(), 2);

    let entry = db.queue.get_entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Error);
    assert!(entry.trace.contains("retrying after 20ms backoff"));
    assert!(entry.trace.contains("retries exhausted"));
    let result = entry.result.unwrap();
    assert_eq!(result["contentFiltered"], false);
    assert_eq!(result["attempts"], 2);
}

#[tokio::test]
async fn test_content_policy_fails_without_retry() {
    let db = TestDb::new().await;
    let service = db.service();
    let id = enqueue_one(&service, "something forbidden").await;

    let transport = ScriptedTransport::new(vec![Err(ProviderError::from_status(
        404,
        "Request rejected: content policy violation",
    ))]);
    worker(&service, &db, transport.clone()).run_once().await.unwrap();

    assert_eq!(transport.posts(), 1);
    let entry = db.queue.get_entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Error);
    assert!(entry.trace.contains("not retryable"));
    let result = entry.result.unwrap();
    assert_eq!(result["contentFiltered"], true);
    assert_eq!(result["attempts"], 1);
    assert_eq!(result["class"], "content_policy");
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let db = TestDb::new().await;
    let service = db.service();
    let id = enqueue_one(&service, "a quiet library").await;

    let transport = ScriptedTransport::new(vec![
        Err(ProviderError::RateLimited("slow down".into())),
        Ok(json!({"choices": [{"message": {"content": "Rows of oak shelves."}, "finish_reason": "stop"}]})),
    ]);
    let summary = worker(&service, &db, transport).run_once().await.unwrap();
    assert_eq!(summary.completed, 1);

    let entry = db.queue.get_entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Complete);
    assert_eq!(entry.result.unwrap()["text"], "Rows of oak shelves.");
    assert!(entry.trace.contains("completed on attempt 2"));
}

#[tokio::test]
async fn test_duplicate_enqueue_creates_one_document() {
    let db = TestDb::new().await;
    let service = db.service();
    let entry = NewEntry::new(
        ProviderKind::Stability,
        EntryType::Structure,
        json!({
            "sceneId": "S1",
            "chapter": 0,
            "scene_number": 2,
            "retry": false,
            "imageUrl": "https://images.local/S1.png"
        }),
    );

    let first = service.enqueue(std::slice::from_ref(&entry)).await.unwrap();
    let second = service.enqueue(&[entry]).await.unwrap();
    assert_eq!(first.created, vec!["stability_structure_S1_0_2".to_string()]);
    assert!(second.created.is_empty());
    assert_eq!(second.skipped, vec!["stability_structure_S1_0_2".to_string()]);

    let stored = db
        .queue
        .get_entries(&EntryQuery {
            provider: Some(ProviderKind::Stability),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, "stability_structure_S1_0_2");
}
