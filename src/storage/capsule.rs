//! Capsule records, key layout, and index maintenance.
//!
//! A capsule is one schedulable delivery unit: title, message, media
//! references, a recipient specification, and a due instant. Capsules
//! live in the key-value store together with a compact pending index so
//! the scanner never enumerates the full capsule table.

use crate::errors::StorageError;
use crate::storage::kv::{KvStore, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Key layout for everything the dispatcher persists.
pub mod keys {
    pub const CAPSULE_PREFIX: &str = "eras:capsule:";
    pub const PENDING_INDEX: &str = "eras:pending";
    pub const LOCK_PREFIX: &str = "eras:lock:";
    pub const MARKER_PREFIX: &str = "eras:sent:";
    pub const RECEIVED_PREFIX: &str = "eras:received:";
    pub const NOTIFICATION_PREFIX: &str = "eras:notification:";
    pub const ACHIEVEMENT_PREFIX: &str = "eras:achievement:";

    pub fn capsule_key(id: &str) -> String {
        format!("{}{}", CAPSULE_PREFIX, id)
    }

    pub fn cycle_lock_key() -> String {
        format!("{}cycle", LOCK_PREFIX)
    }

    pub fn capsule_lock_key(id: &str) -> String {
        format!("{}capsule:{}", LOCK_PREFIX, id)
    }

    pub fn marker_key(capsule_id: &str, recipient: &str) -> String {
        format!("{}{}:{}", MARKER_PREFIX, capsule_id, recipient)
    }

    pub fn received_key(recipient: &str) -> String {
        format!("{}{}", RECEIVED_PREFIX, recipient)
    }

    pub fn notification_key(capsule_id: &str) -> String {
        format!("{}{}", NOTIFICATION_PREFIX, capsule_id)
    }

    pub fn achievement_key(owner: &str) -> String {
        format!("{}{}:capsules_delivered", ACHIEVEMENT_PREFIX, owner)
    }
}

/// Lifecycle state of a capsule.
///
/// `Delivered` and `Draft` are terminal for automation: the scanner
/// prunes them from the pending index on sight. A failed delivery lands
/// back in `Draft` (editable, re-schedulable), never in a dead-end
/// failed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapsuleStatus {
    Scheduled,
    Delivering,
    Delivered,
    Draft,
}

impl CapsuleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CapsuleStatus::Delivered | CapsuleStatus::Draft)
    }
}

/// Who a capsule is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    /// Delivered to the authoring account's own contact.
    #[serde(rename = "self")]
    SelfContact,
    /// Delivered to a list of external contacts.
    Others,
}

/// One schedulable delivery unit.
///
/// `due_at` is kept as the raw stored text because upstream authoring
/// data is untrusted: a malformed timestamp must surface as a
/// per-capsule corruption (converted to draft with a reason), not as a
/// deserialization failure that hides the whole record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capsule {
    pub id: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub due_at: Option<String>,
    pub recipient_kind: RecipientKind,
    /// Stored self-contact; shape is untrusted and may be a bare string
    /// or a structured object.
    #[serde(default)]
    pub self_contact: Option<Value>,
    /// External contacts in heterogeneous shapes.
    #[serde(default)]
    pub recipients: Vec<Value>,
    pub status: CapsuleStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    /// The due date a capsule had before a failed delivery cleared it.
    #[serde(default)]
    pub original_delivery_date: Option<String>,
    /// Media attachment ids, resolved to signed URLs at send time.
    #[serde(default)]
    pub media_ids: Vec<String>,
    /// Direct media URLs embedded as-is.
    #[serde(default)]
    pub media_urls: Vec<String>,
    /// Soft-delete flag; deleted capsules are never dispatched.
    #[serde(default)]
    pub deleted: bool,
    /// Registered email of the owning account, used as the self-contact
    /// fallback and for self-addressed detection.
    pub owner_email: String,
}

impl Capsule {
    /// Parse the stored due timestamp into an absolute instant.
    ///
    /// `Ok(None)` means no due date is set (draft-authored capsule);
    /// `Err` carries the parse failure for draft conversion.
    pub fn due_instant(&self) -> Result<Option<DateTime<Utc>>, String> {
        match &self.due_at {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| format!("malformed due date {:?}: {}", raw, e)),
        }
    }

    /// Total media references carried by this capsule.
    pub fn media_count(&self) -> usize {
        self.media_ids.len() + self.media_urls.len()
    }
}

/// Capsule persistence and index maintenance over the key-value store.
#[derive(Clone)]
pub struct CapsuleStore {
    kv: Arc<dyn KvStore>,
}

impl CapsuleStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub async fn get(&self, id: &str) -> StorageResult<Option<Capsule>> {
        let key = keys::capsule_key(id);
        match self.kv.get(&key).await? {
            Some(value) => {
                let capsule = serde_json::from_value(value).map_err(|source| {
                    StorageError::Deserialization {
                        data_type: "Capsule".to_string(),
                        key,
                        source,
                    }
                })?;
                Ok(Some(capsule))
            }
            None => Ok(None),
        }
    }

    pub async fn put(&self, capsule: &Capsule) -> StorageResult<()> {
        let value = serde_json::to_value(capsule).map_err(|source| {
            StorageError::Serialization {
                data_type: "Capsule".to_string(),
                source,
            }
        })?;
        self.kv.set(&keys::capsule_key(&capsule.id), &value).await
    }

    /// Read the pending index. A missing index is an empty index.
    pub async fn pending_ids(&self) -> StorageResult<Vec<String>> {
        match self.kv.get(keys::PENDING_INDEX).await? {
            Some(Value::Array(items)) => Ok(items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()),
            Some(_) | None => Ok(Vec::new()),
        }
    }

    pub async fn write_pending_ids(&self, ids: &[String]) -> StorageResult<()> {
        let value = Value::Array(ids.iter().map(|id| Value::String(id.clone())).collect());
        self.kv.set(keys::PENDING_INDEX, &value).await
    }

    /// Remove one id from the pending index (read-modify-write; the
    /// index is not the source of truth, so lost updates are tolerable
    /// and repaired by later lazy pruning).
    pub async fn remove_pending(&self, id: &str) -> StorageResult<()> {
        let mut ids = self.pending_ids().await?;
        let before = ids.len();
        ids.retain(|existing| existing != id);
        if ids.len() != before {
            self.write_pending_ids(&ids).await?;
        }
        Ok(())
    }

    pub async fn add_pending(&self, id: &str) -> StorageResult<()> {
        let mut ids = self.pending_ids().await?;
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
            self.write_pending_ids(&ids).await?;
        }
        Ok(())
    }

    /// Record a delivered capsule under the recipient's received index.
    pub async fn add_received(&self, recipient: &str, capsule_id: &str) -> StorageResult<()> {
        let key = keys::received_key(recipient);
        let mut ids: Vec<String> = match self.kv.get(&key).await? {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        if !ids.iter().any(|existing| existing == capsule_id) {
            ids.push(capsule_id.to_string());
            let value = Value::Array(ids.into_iter().map(Value::String).collect());
            self.kv.set(&key, &value).await?;
        }
        Ok(())
    }

    /// Undo a partial received-index registration after a failed task.
    pub async fn remove_received(&self, recipient: &str, capsule_id: &str) -> StorageResult<()> {
        let key = keys::received_key(recipient);
        if let Some(Value::Array(items)) = self.kv.get(&key).await? {
            let ids: Vec<String> = items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .filter(|id| id != capsule_id)
                .collect();
            let value = Value::Array(ids.into_iter().map(Value::String).collect());
            self.kv.set(&key, &value).await?;
        }
        Ok(())
    }
}
