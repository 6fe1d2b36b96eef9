//! Key-value store adapter.
//!
//! The hosted platform under Eras exposes only get/set/delete/list
//! semantics over opaque JSON values, with transient failures expected
//! (cold starts, gateway errors). Everything the dispatcher persists
//! (capsules, the pending index, locks, idempotency markers, hook
//! records) goes through this trait, so production runs against Redis
//! while tests run against the in-memory implementation.

use crate::errors::StorageError;
use async_trait::async_trait;
use deadpool_redis::redis::{AsyncCommands, cmd};
use deadpool_redis::{Config as RedisConfig, Pool, Runtime};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;

/// Result type alias for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Narrow key-value interface over opaque JSON values.
///
/// Implementations must be `Send + Sync` and safe to call concurrently.
/// A missing key is `Ok(None)`; infrastructure failures are errors and
/// must never be reported as "value absent".
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    async fn set(&self, key: &str, value: &Value) -> StorageResult<()>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List all keys starting with `prefix`. Ordering is unspecified.
    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Lightweight connectivity check for the health endpoint.
    async fn health_check(&self) -> StorageResult<()>;
}

/// Create a Redis connection pool from a Redis URL.
pub fn create_kv_pool(redis_url: &str) -> StorageResult<Pool> {
    let cfg = RedisConfig::from_url(redis_url);
    cfg.create_pool(Some(Runtime::Tokio1))
        .map_err(|err| StorageError::Pool {
            details: format!("failed to create Redis pool: {}", err),
        })
}

/// Redis-backed key-value store.
///
/// Every operation is bounded by `op_timeout`; a timed-out operation is
/// reported as [`StorageError::Timeout`] and treated by callers as a
/// transient failure, not as an absent value.
pub struct RedisKvStore {
    pool: Pool,
    op_timeout: Duration,
}

impl RedisKvStore {
    pub fn new(pool: Pool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    async fn connection(&self) -> StorageResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|err| StorageError::Pool {
            details: format!("failed to get Redis connection: {}", err),
        })
    }

    fn unavailable(operation: &str, err: impl std::fmt::Display) -> StorageError {
        StorageError::Unavailable {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = timeout(self.op_timeout, conn.get::<_, Option<String>>(key))
            .await
            .map_err(|_| StorageError::Timeout {
                operation: format!("get {}", key),
            })?
            .map_err(|e| Self::unavailable("get", e))?;

        match raw {
            Some(text) => {
                let value = serde_json::from_str(&text).map_err(|source| {
                    StorageError::Deserialization {
                        data_type: "json".to_string(),
                        key: key.to_string(),
                        source,
                    }
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value) -> StorageResult<()> {
        let text = serde_json::to_string(value).map_err(|source| StorageError::Serialization {
            data_type: "json".to_string(),
            source,
        })?;
        let mut conn = self.connection().await?;
        timeout(self.op_timeout, conn.set::<_, _, ()>(key, text))
            .await
            .map_err(|_| StorageError::Timeout {
                operation: format!("set {}", key),
            })?
            .map_err(|e| Self::unavailable("set", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut conn = self.connection().await?;
        timeout(self.op_timeout, conn.del::<_, ()>(key))
            .await
            .map_err(|_| StorageError::Timeout {
                operation: format!("delete {}", key),
            })?
            .map_err(|e| Self::unavailable("delete", e))?;
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut scan_cmd = cmd("SCAN");
            scan_cmd
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100);
            let scan = scan_cmd.query_async::<(u64, Vec<String>)>(&mut conn);
            let (next, batch) = timeout(self.op_timeout, scan)
                .await
                .map_err(|_| StorageError::Timeout {
                    operation: format!("scan {}", prefix),
                })?
                .map_err(|e| Self::unavailable("scan", e))?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }

    async fn health_check(&self) -> StorageResult<()> {
        let mut conn = self.connection().await?;
        let ping_cmd = cmd("PING");
        let pong = ping_cmd.query_async::<String>(&mut conn);
        timeout(self.op_timeout, pong)
            .await
            .map_err(|_| StorageError::Timeout {
                operation: "ping".to_string(),
            })?
            .map_err(|e| Self::unavailable("ping", e))?;
        Ok(())
    }
}

/// In-memory implementation for testing.
///
/// Supports failure injection so scanner/lock behavior under a failing
/// store can be exercised without a real backend: `fail_all` makes every
/// operation return a transient error, `fail_keys` targets specific keys.
#[derive(Default)]
pub struct MemoryKvStore {
    values: Arc<RwLock<BTreeMap<String, Value>>>,
    fail_all: Arc<RwLock<bool>>,
    fail_keys: Arc<RwLock<HashSet<String>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.fail_all.write().await = unavailable;
    }

    pub async fn fail_key(&self, key: &str) {
        self.fail_keys.write().await.insert(key.to_string());
    }

    async fn check_failure(&self, key: &str, operation: &str) -> StorageResult<()> {
        if *self.fail_all.read().await || self.fail_keys.read().await.contains(key) {
            return Err(StorageError::Unavailable {
                operation: operation.to_string(),
                details: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        self.check_failure(key, "get").await?;
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> StorageResult<()> {
        self.check_failure(key, "set").await?;
        self.values
            .write()
            .await
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.check_failure(key, "delete").await?;
        self.values.write().await.remove(key);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.check_failure(prefix, "scan").await?;
        Ok(self
            .values
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.check_failure("", "ping").await
    }
}
