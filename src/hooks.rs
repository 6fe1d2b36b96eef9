//! Best-effort post-delivery hooks.
//!
//! Hooks run after the authoritative `delivered` transition commits.
//! Each runs inside its own error boundary: a hook failure is logged and
//! swallowed, never rolling back or downgrading the delivery.

use crate::storage::capsule::{Capsule, keys};
use crate::storage::kv::KvStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait PostDeliveryHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_delivered(&self, capsule: &Capsule) -> anyhow::Result<()>;
}

/// Run every hook, isolating failures.
pub async fn run_hooks(hooks: &[Arc<dyn PostDeliveryHook>], capsule: &Capsule) {
    for hook in hooks {
        match hook.on_delivered(capsule).await {
            Ok(()) => debug!(hook = hook.name(), capsule = %capsule.id, "Post-delivery hook ran"),
            Err(err) => warn!(
                hook = hook.name(),
                capsule = %capsule.id,
                error = %err,
                "Post-delivery hook failed, continuing"
            ),
        }
    }
}

/// Writes an in-app notification record for the owner.
pub struct NotificationHook {
    kv: Arc<dyn KvStore>,
}

impl NotificationHook {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl PostDeliveryHook for NotificationHook {
    fn name(&self) -> &'static str {
        "notification"
    }

    async fn on_delivered(&self, capsule: &Capsule) -> anyhow::Result<()> {
        let record = serde_json::json!({
            "type": "capsule_delivered",
            "capsule_id": capsule.id,
            "title": capsule.title,
            "owner": capsule.owner_email,
            "at": Utc::now().to_rfc3339(),
        });
        self.kv
            .set(&keys::notification_key(&capsule.id), &record)
            .await?;
        Ok(())
    }
}

/// Increments the owner's delivered-capsule counter for the
/// achievement system.
pub struct AchievementHook {
    kv: Arc<dyn KvStore>,
}

impl AchievementHook {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl PostDeliveryHook for AchievementHook {
    fn name(&self) -> &'static str {
        "achievement"
    }

    async fn on_delivered(&self, capsule: &Capsule) -> anyhow::Result<()> {
        let key = keys::achievement_key(&capsule.owner_email);
        let count = self
            .kv
            .get(&key)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        self.kv.set(&key, &serde_json::json!(count + 1)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::capsule::test_fixtures::scheduled_capsule;
    use crate::storage::kv::{KvStore, MemoryKvStore};

    struct FailingHook;

    #[async_trait]
    impl PostDeliveryHook for FailingHook {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn on_delivered(&self, _capsule: &Capsule) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn test_hook_failure_does_not_stop_later_hooks() {
        let kv = Arc::new(MemoryKvStore::new());
        let hooks: Vec<Arc<dyn PostDeliveryHook>> = vec![
            Arc::new(FailingHook),
            Arc::new(NotificationHook::new(kv.clone())),
        ];
        let capsule = scheduled_capsule("c1");

        run_hooks(&hooks, &capsule).await;

        let record = kv.get(&keys::notification_key("c1")).await.unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn test_achievement_counter_increments() {
        let kv = Arc::new(MemoryKvStore::new());
        let hook = AchievementHook::new(kv.clone());
        let capsule = scheduled_capsule("c1");

        hook.on_delivered(&capsule).await.unwrap();
        hook.on_delivered(&capsule).await.unwrap();

        let count = kv
            .get(&keys::achievement_key("me@example.com"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, serde_json::json!(2));
    }
}
