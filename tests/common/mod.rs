use chrono::{Duration as ChronoDuration, Utc};
use eras_dispatch::config::{Config, CycleConfig, HttpPort, StalenessConfig};
use eras_dispatch::delivery::DeliveryExecutor;
use eras_dispatch::dispatcher::Dispatcher;
use eras_dispatch::email::RecordingEmailChannel;
use eras_dispatch::hooks::{NotificationHook, PostDeliveryHook};
use eras_dispatch::idempotency::IdempotencyGuard;
use eras_dispatch::lock::LockManager;
use eras_dispatch::metrics::NoOpMetricsPublisher;
use eras_dispatch::outcome::OutcomePolicy;
use eras_dispatch::scanner::DueScanner;
use eras_dispatch::storage::capsule::{Capsule, CapsuleStatus, CapsuleStore, RecipientKind};
use eras_dispatch::storage::kv::{KvStore, MemoryKvStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub fn test_config() -> Config {
    Config {
        version: "test".to_string(),
        http_port: HttpPort::default(),
        redis_url: "redis://unused".to_string(),
        dry_run: false,
        cycle: CycleConfig {
            batch_pause_ms: 0,
            ..CycleConfig::default()
        },
        staleness: StalenessConfig::default(),
        email: None,
        blob: None,
        statsd_addr: None,
    }
}

/// A scheduled capsule due five minutes ago, addressed to its owner.
pub fn due_capsule(id: &str) -> Capsule {
    let now = Utc::now();
    Capsule {
        id: id.to_string(),
        title: "Letter to the future".to_string(),
        message: "Remember the summer of 2025.".to_string(),
        due_at: Some((now - ChronoDuration::minutes(5)).to_rfc3339()),
        recipient_kind: RecipientKind::SelfContact,
        self_contact: Some(Value::String("me@example.com".to_string())),
        recipients: Vec::new(),
        status: CapsuleStatus::Scheduled,
        attempt_count: 0,
        last_attempt_at: None,
        created_at: now - ChronoDuration::days(30),
        updated_at: now - ChronoDuration::days(30),
        delivered_at: None,
        failure_reason: None,
        failed_at: None,
        original_delivery_date: None,
        media_ids: Vec::new(),
        media_urls: Vec::new(),
        deleted: false,
        owner_email: "me@example.com".to_string(),
    }
}

/// Wire a full dispatcher over a shared in-memory store.
pub fn build_dispatcher(
    kv: Arc<MemoryKvStore>,
    email: Arc<RecordingEmailChannel>,
    holder: &str,
) -> Dispatcher {
    let config = test_config();
    let kv_dyn: Arc<dyn KvStore> = kv;
    let store = CapsuleStore::new(kv_dyn.clone());
    let locks = LockManager::new(kv_dyn.clone(), holder.to_string(), Duration::from_secs(3));
    let scanner = DueScanner::new(
        store.clone(),
        config.cycle.batch_size,
        Duration::ZERO,
        ChronoDuration::seconds(config.staleness.stuck_delivering_secs as i64),
        true,
    );
    let guard = Arc::new(IdempotencyGuard::new(
        kv_dyn.clone(),
        ChronoDuration::seconds(config.staleness.marker_stale_secs as i64),
    ));
    let executor = DeliveryExecutor::new(guard, email, None, "capsule-media".to_string(), 3600);
    let hooks: Vec<Arc<dyn PostDeliveryHook>> = vec![Arc::new(NotificationHook::new(kv_dyn))];
    let policy = OutcomePolicy::new(store.clone(), hooks);
    Dispatcher::new(
        store,
        locks,
        scanner,
        executor,
        policy,
        Arc::new(NoOpMetricsPublisher),
        &config,
    )
}
