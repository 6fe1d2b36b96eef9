//! At-most-once delivery under concurrent dispatcher instances.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{build_dispatcher, due_capsule};
use eras_dispatch::email::RecordingEmailChannel;
use eras_dispatch::idempotency::{IdempotencyGuard, MarkerState};
use eras_dispatch::storage::capsule::{CapsuleStatus, CapsuleStore, RecipientKind};
use eras_dispatch::storage::kv::{KvStore, MemoryKvStore};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_five_concurrent_cycles_send_once_per_recipient() {
    let kv = Arc::new(MemoryKvStore::new());
    let email = Arc::new(RecordingEmailChannel::new());
    let store = CapsuleStore::new(kv.clone() as Arc<dyn KvStore>);

    let mut capsule = due_capsule("c1");
    capsule.recipient_kind = RecipientKind::Others;
    capsule.recipients = vec![json!("a@example.com"), json!("b@example.com")];
    store.put(&capsule).await.unwrap();
    store.add_pending("c1").await.unwrap();

    let dispatchers: Vec<_> = (0..5)
        .map(|i| {
            Arc::new(build_dispatcher(
                kv.clone(),
                email.clone(),
                &format!("instance-{}", i),
            ))
        })
        .collect();

    let now = Utc::now();
    let handles: Vec<_> = dispatchers
        .iter()
        .map(|d| {
            let d = d.clone();
            tokio::spawn(async move { d.run_cycle(now).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(email.sent_to("a@example.com").await, 1);
    assert_eq!(email.sent_to("b@example.com").await, 1);

    let guard = IdempotencyGuard::new(
        kv.clone() as Arc<dyn KvStore>,
        ChronoDuration::seconds(600),
    );
    assert_eq!(
        guard.marker_state("c1", "a@example.com").await.unwrap(),
        Some(MarkerState::Sent)
    );
    assert_eq!(
        guard.marker_state("c1", "b@example.com").await.unwrap(),
        Some(MarkerState::Sent)
    );

    let delivered = store.get("c1").await.unwrap().unwrap();
    assert_eq!(delivered.status, CapsuleStatus::Delivered);
    assert!(store.pending_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sequential_cycles_do_not_resend() {
    let kv = Arc::new(MemoryKvStore::new());
    let email = Arc::new(RecordingEmailChannel::new());
    let store = CapsuleStore::new(kv.clone() as Arc<dyn KvStore>);

    store.put(&due_capsule("c1")).await.unwrap();
    store.add_pending("c1").await.unwrap();

    let dispatcher = build_dispatcher(kv.clone(), email.clone(), "instance-1");
    dispatcher.run_cycle(Utc::now()).await;
    // The index is clean, but even a stale index entry must not resend.
    store.add_pending("c1").await.unwrap();
    dispatcher.run_cycle(Utc::now()).await;

    assert_eq!(email.sent_to("me@example.com").await, 1);
    assert!(store.pending_ids().await.unwrap().is_empty());
}
