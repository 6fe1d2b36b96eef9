//! End-to-end dispatch cycle behavior over a shared in-memory store.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{build_dispatcher, due_capsule};
use eras_dispatch::email::RecordingEmailChannel;
use eras_dispatch::idempotency::{IdempotencyGuard, MarkerState};
use eras_dispatch::storage::capsule::{CapsuleStatus, CapsuleStore, RecipientKind};
use eras_dispatch::storage::kv::{KvStore, MemoryKvStore};
use serde_json::json;
use std::sync::Arc;

fn store(kv: &Arc<MemoryKvStore>) -> CapsuleStore {
    CapsuleStore::new(kv.clone() as Arc<dyn KvStore>)
}

fn guard(kv: &Arc<MemoryKvStore>) -> IdempotencyGuard {
    IdempotencyGuard::new(
        kv.clone() as Arc<dyn KvStore>,
        ChronoDuration::seconds(600),
    )
}

#[tokio::test]
async fn test_due_capsule_is_delivered_to_owner() {
    let kv = Arc::new(MemoryKvStore::new());
    let email = Arc::new(RecordingEmailChannel::new());
    let store = store(&kv);

    store.put(&due_capsule("c1")).await.unwrap();
    store.add_pending("c1").await.unwrap();

    let dispatcher = build_dispatcher(kv.clone(), email.clone(), "instance-1");
    let summary = dispatcher.run_cycle(Utc::now()).await;

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(email.sent_to("me@example.com").await, 1);

    let delivered = store.get("c1").await.unwrap().unwrap();
    assert_eq!(delivered.status, CapsuleStatus::Delivered);
    assert!(delivered.delivered_at.is_some());
    assert!(store.pending_ids().await.unwrap().is_empty());

    let marker = guard(&kv).marker_state("c1", "me@example.com").await.unwrap();
    assert_eq!(marker, Some(MarkerState::Sent));
}

#[tokio::test]
async fn test_future_capsule_is_not_delivered_early() {
    let kv = Arc::new(MemoryKvStore::new());
    let email = Arc::new(RecordingEmailChannel::new());
    let store = store(&kv);

    let mut capsule = due_capsule("c1");
    capsule.due_at = Some((Utc::now() + ChronoDuration::hours(1)).to_rfc3339());
    store.put(&capsule).await.unwrap();
    store.add_pending("c1").await.unwrap();

    let dispatcher = build_dispatcher(kv, email.clone(), "instance-1");
    let summary = dispatcher.run_cycle(Utc::now()).await;

    assert_eq!(summary.processed, 0);
    assert!(email.sent().await.is_empty());
    assert_eq!(store.pending_ids().await.unwrap(), vec!["c1"]);
    let untouched = store.get("c1").await.unwrap().unwrap();
    assert_eq!(untouched.status, CapsuleStatus::Scheduled);
    assert_eq!(untouched.attempt_count, 0);
}

#[tokio::test]
async fn test_racing_dispatchers_deliver_once() {
    let kv = Arc::new(MemoryKvStore::new());
    let email = Arc::new(RecordingEmailChannel::new());
    let store = store(&kv);

    store.put(&due_capsule("c1")).await.unwrap();
    store.add_pending("c1").await.unwrap();

    let a = build_dispatcher(kv.clone(), email.clone(), "instance-a");
    let b = build_dispatcher(kv.clone(), email.clone(), "instance-b");

    let now = Utc::now();
    let (sa, sb) = tokio::join!(a.run_cycle(now), b.run_cycle(now));

    // The cycle lock lets at most one instance make progress; the
    // idempotency marker backstops it even if both got through.
    assert!(sa.successful + sb.successful <= 1);
    assert_eq!(email.sent_to("me@example.com").await, 1);

    let delivered = store.get("c1").await.unwrap().unwrap();
    assert_eq!(delivered.status, CapsuleStatus::Delivered);
}

#[tokio::test]
async fn test_partial_failure_drafts_then_resend_skips_delivered_recipient() {
    let kv = Arc::new(MemoryKvStore::new());
    let email = Arc::new(RecordingEmailChannel::new());
    let store = store(&kv);

    let mut capsule = due_capsule("c1");
    capsule.recipient_kind = RecipientKind::Others;
    capsule.recipients = vec![json!("a@example.com"), json!("b@example.com")];
    let original_due = capsule.due_at.clone();
    store.put(&capsule).await.unwrap();
    store.add_pending("c1").await.unwrap();

    email.fail_address("b@example.com").await;
    let dispatcher = build_dispatcher(kv.clone(), email.clone(), "instance-1");

    let summary = dispatcher.run_cycle(Utc::now()).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(email.sent_to("a@example.com").await, 1);
    assert_eq!(email.sent_to("b@example.com").await, 0);

    let draft = store.get("c1").await.unwrap().unwrap();
    assert_eq!(draft.status, CapsuleStatus::Draft);
    assert!(draft.due_at.is_none());
    assert_eq!(draft.original_delivery_date, original_due);
    assert!(draft.failure_reason.is_some());
    assert!(store.pending_ids().await.unwrap().is_empty());

    // A's sent marker persists across the draft conversion.
    let g = guard(&kv);
    assert_eq!(
        g.marker_state("c1", "a@example.com").await.unwrap(),
        Some(MarkerState::Sent)
    );
    assert_eq!(g.marker_state("c1", "b@example.com").await.unwrap(), None);

    // User re-schedules the draft; the provider recovers.
    email.clear_failures().await;
    let mut rescheduled = draft.clone();
    rescheduled.status = CapsuleStatus::Scheduled;
    rescheduled.due_at = Some((Utc::now() - ChronoDuration::minutes(1)).to_rfc3339());
    rescheduled.failure_reason = None;
    store.put(&rescheduled).await.unwrap();
    store.add_pending("c1").await.unwrap();

    let retry = dispatcher.run_cycle(Utc::now()).await;
    assert_eq!(retry.successful, 1);

    // A does not receive a duplicate; B gets their copy.
    assert_eq!(email.sent_to("a@example.com").await, 1);
    assert_eq!(email.sent_to("b@example.com").await, 1);
    let delivered = store.get("c1").await.unwrap().unwrap();
    assert_eq!(delivered.status, CapsuleStatus::Delivered);
}

#[tokio::test]
async fn test_corrupt_due_date_drafts_without_affecting_siblings() {
    let kv = Arc::new(MemoryKvStore::new());
    let email = Arc::new(RecordingEmailChannel::new());
    let store = store(&kv);

    let mut corrupt = due_capsule("bad");
    corrupt.due_at = Some("not-a-timestamp".to_string());
    store.put(&corrupt).await.unwrap();
    store.put(&due_capsule("good")).await.unwrap();
    store.add_pending("bad").await.unwrap();
    store.add_pending("good").await.unwrap();

    let dispatcher = build_dispatcher(kv, email.clone(), "instance-1");
    let summary = dispatcher.run_cycle(Utc::now()).await;

    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(email.sent_to("me@example.com").await, 1);

    let drafted = store.get("bad").await.unwrap().unwrap();
    assert_eq!(drafted.status, CapsuleStatus::Draft);
    assert!(
        drafted
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("unschedulable")
    );

    let delivered = store.get("good").await.unwrap().unwrap();
    assert_eq!(delivered.status, CapsuleStatus::Delivered);
    assert!(store.pending_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_capsule_is_never_dispatched() {
    let kv = Arc::new(MemoryKvStore::new());
    let email = Arc::new(RecordingEmailChannel::new());
    let store = store(&kv);

    let mut capsule = due_capsule("c1");
    capsule.deleted = true;
    store.put(&capsule).await.unwrap();
    store.add_pending("c1").await.unwrap();

    let dispatcher = build_dispatcher(kv, email.clone(), "instance-1");
    let summary = dispatcher.run_cycle(Utc::now()).await;

    assert_eq!(summary.processed, 0);
    assert!(email.sent().await.is_empty());
}
