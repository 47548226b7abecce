//! Concurrent claimers never receive the same entry.

mod common;

use std::sync::Arc;

use dashmap::DashSet;
use narrative_queue::database::models::{EntryStatus, EntryType, ProviderKind};
use narrative_queue::database::repositories::{EntryQuery, QueueRepository};
use narrative_queue::queue::NewEntry;
use serde_json::json;
use tokio::task::JoinSet;

use common::TestDb;

const ENTRIES: usize = 30;
const CLAIMERS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    let db = TestDb::new().await;
    let service = db.service();

    let entries: Vec<NewEntry> = (0..ENTRIES)
        .map(|i| {
            NewEntry::new(
                ProviderKind::OpenAi,
                EntryType::Completion,
                json!({"prompt": format!("prompt {}", i)}),
            )
        })
        .collect();
    let outcome = service.enqueue(&entries).await.unwrap();
    assert_eq!(outcome.created.len(), ENTRIES);

    // A different provider's pending entry must never be claimed here.
    service
        .enqueue(&[NewEntry::new(
            ProviderKind::Gemini,
            EntryType::Completion,
            json!({"prompt": "other"}),
        )])
        .await
        .unwrap();

    let seen = Arc::new(DashSet::new());
    let mut tasks = JoinSet::new();
    for _ in 0..CLAIMERS {
        let repo = db.queue.clone();
        let seen = seen.clone();
        tasks.spawn(async move {
            let mut claimed = 0usize;
            loop {
                let batch = repo.claim_pending(ProviderKind::OpenAi, 5).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                for entry in batch {
                    assert_eq!(entry.status, EntryStatus::Processing);
                    assert!(entry.processing_started.is_some());
                    assert!(seen.insert(entry.id.clone()), "entry {} claimed twice", entry.id);
                    claimed += 1;
                }
            }
            claimed
        });
    }

    let mut total = 0;
    while let Some(result) = tasks.join_next().await {
        total += result.unwrap();
    }
    assert_eq!(total, ENTRIES);
    assert_eq!(seen.len(), ENTRIES);

    let pending = db
        .queue
        .get_entries(&EntryQuery {
            status: Some(EntryStatus::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].provider, ProviderKind::Gemini);
}
