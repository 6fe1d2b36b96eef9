//! Time-boxed exclusive locks over a key-value store without
//! compare-and-swap.
//!
//! The backing store offers only get/set/delete, so a claim cannot be
//! atomic. Instead every claim writes a record tagged with a unique
//! token and then re-reads the key: if another claimant overwrote it in
//! the interim, the re-read shows a foreign token and this claimant must
//! treat the lock as not acquired even though its own write succeeded.
//!
//! Locks expire by age rather than by explicit release so a crashed
//! holder never wedges the system. Any store error or timeout during
//! acquisition means "could not confirm exclusivity" and the caller
//! skips its cycle: a skipped cycle is recoverable, two holders are not.

use crate::errors::{LockError, StorageError};
use crate::storage::kv::KvStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Stored lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone)]
pub struct LockAttempt {
    pub acquired: bool,
    /// Holder observed at the key when acquisition failed.
    pub current_holder: Option<String>,
}

impl LockAttempt {
    fn held_by(holder: String) -> Self {
        Self {
            acquired: false,
            current_holder: Some(holder),
        }
    }
}

/// Lock manager keyed by arbitrary strings (one key per cycle, one per
/// capsule).
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    /// Identifies this process instance in lock records.
    holder_id: String,
    acquire_timeout: Duration,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>, holder_id: String, acquire_timeout: Duration) -> Self {
        Self {
            kv,
            holder_id,
            acquire_timeout,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Attempt to acquire the lock at `key`.
    ///
    /// An existing record younger than `stale_after` blocks the claim.
    /// An absent or stale record is claimed with a fresh token, then
    /// verified by re-read. Errors and timeouts are returned to the
    /// caller, which must treat them as "not acquired".
    pub async fn try_acquire(
        &self,
        key: &str,
        stale_after: ChronoDuration,
    ) -> Result<LockAttempt, LockError> {
        match timeout(self.acquire_timeout, self.acquire_inner(key, stale_after)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %key, "Lock acquisition timed out");
                Err(LockError::AcquireTimeout {
                    key: key.to_string(),
                })
            }
        }
    }

    async fn acquire_inner(
        &self,
        key: &str,
        stale_after: ChronoDuration,
    ) -> Result<LockAttempt, LockError> {
        let now = Utc::now();

        if let Some(existing) = self.read_lock(key).await? {
            let age = now - existing.acquired_at;
            if age < stale_after {
                debug!(
                    key = %key,
                    holder = %existing.holder,
                    age_secs = age.num_seconds(),
                    "Lock held by another instance"
                );
                return Ok(LockAttempt::held_by(existing.holder));
            }
            debug!(
                key = %key,
                holder = %existing.holder,
                age_secs = age.num_seconds(),
                "Reclaiming stale lock"
            );
        }

        let record = LockRecord {
            holder: self.holder_id.clone(),
            token: Uuid::new_v4().to_string(),
            acquired_at: now,
        };
        self.write_lock(key, &record).await?;

        // The write above is not atomic with the read; a peer may have
        // overwritten the key between our write and now. Only the token
        // that survives the re-read owns the lock.
        match self.read_lock(key).await? {
            Some(observed) if observed.token == record.token => {
                debug!(key = %key, holder = %self.holder_id, "Lock acquired");
                Ok(LockAttempt {
                    acquired: true,
                    current_holder: Some(self.holder_id.clone()),
                })
            }
            Some(observed) => {
                debug!(
                    key = %key,
                    winner = %observed.holder,
                    "Lost lock claim race to another instance"
                );
                Ok(LockAttempt::held_by(observed.holder))
            }
            None => Ok(LockAttempt {
                acquired: false,
                current_holder: None,
            }),
        }
    }

    /// Unconditional delete; safe to call on an expired or foreign lock
    /// only by the holder that believes it owns the key.
    pub async fn release(&self, key: &str) -> Result<(), LockError> {
        self.kv
            .delete(key)
            .await
            .map_err(|source| LockError::Store {
                key: key.to_string(),
                source,
            })
    }

    async fn read_lock(&self, key: &str) -> Result<Option<LockRecord>, LockError> {
        let value = self
            .kv
            .get(key)
            .await
            .map_err(|source| LockError::Store {
                key: key.to_string(),
                source,
            })?;
        match value {
            Some(raw) => {
                let record = serde_json::from_value(raw).map_err(|source| LockError::Store {
                    key: key.to_string(),
                    source: StorageError::Deserialization {
                        data_type: "LockRecord".to_string(),
                        key: key.to_string(),
                        source,
                    },
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn write_lock(&self, key: &str, record: &LockRecord) -> Result<(), LockError> {
        let value = serde_json::to_value(record).map_err(|source| LockError::Store {
            key: key.to_string(),
            source: StorageError::Serialization {
                data_type: "LockRecord".to_string(),
                source,
            },
        })?;
        self.kv
            .set(key, &value)
            .await
            .map_err(|source| LockError::Store {
                key: key.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryKvStore;

    fn manager(kv: Arc<dyn KvStore>, holder: &str) -> LockManager {
        LockManager::new(kv, holder.to_string(), Duration::from_secs(3))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let locks = manager(kv, "instance-1");

        let attempt = locks
            .try_acquire("eras:lock:test", ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert!(attempt.acquired);

        locks.release("eras:lock:test").await.unwrap();

        let again = locks
            .try_acquire("eras:lock:test", ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert!(again.acquired);
    }

    #[tokio::test]
    async fn test_fresh_lock_blocks_other_claimants() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let first = manager(kv.clone(), "instance-1");
        let second = manager(kv, "instance-2");

        assert!(
            first
                .try_acquire("eras:lock:test", ChronoDuration::seconds(60))
                .await
                .unwrap()
                .acquired
        );

        let blocked = second
            .try_acquire("eras:lock:test", ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert!(!blocked.acquired);
        assert_eq!(blocked.current_holder.as_deref(), Some("instance-1"));
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimable_without_release() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());

        // Plant a lock record that is already past the staleness threshold.
        let old = LockRecord {
            holder: "crashed-instance".to_string(),
            token: "dead-token".to_string(),
            acquired_at: Utc::now() - ChronoDuration::seconds(300),
        };
        kv.set("eras:lock:test", &serde_json::to_value(&old).unwrap())
            .await
            .unwrap();

        let locks = manager(kv, "instance-2");
        let attempt = locks
            .try_acquire("eras:lock:test", ChronoDuration::seconds(120))
            .await
            .unwrap();
        assert!(attempt.acquired);
    }

    #[tokio::test]
    async fn test_store_failure_means_not_acquired() {
        let mem = Arc::new(MemoryKvStore::new());
        mem.set_unavailable(true).await;
        let kv: Arc<dyn KvStore> = mem;
        let locks = manager(kv, "instance-1");

        let result = locks
            .try_acquire("eras:lock:test", ChronoDuration::seconds(60))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_at_most_one_holder() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let a = manager(kv.clone(), "instance-a");
        let b = manager(kv, "instance-b");

        let (ra, rb) = tokio::join!(
            a.try_acquire("eras:lock:race", ChronoDuration::seconds(60)),
            b.try_acquire("eras:lock:race", ChronoDuration::seconds(60)),
        );
        let acquired = [ra.unwrap().acquired, rb.unwrap().acquired]
            .iter()
            .filter(|&&x| x)
            .count();
        assert!(acquired <= 1, "two holders acquired the same lock");
    }
}
