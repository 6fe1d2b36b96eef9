//! Per (capsule, recipient) idempotency markers.
//!
//! A marker suppresses duplicate external sends when two processor runs
//! race on the same capsule, and lets a retried multi-recipient capsule
//! skip recipients who already received their copy. Markers are removed
//! on send failure so a later retry is not blocked, kept forever on
//! success, and reclaimed when stuck in `sending` past a threshold.

use crate::errors::{DeliveryError, StorageError};
use crate::storage::capsule::keys;
use crate::storage::kv::KvStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerState {
    Sending,
    Sent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMarker {
    pub state: MarkerState,
    pub at: DateTime<Utc>,
    pub token: String,
}

/// Outcome of a dispatch claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// No marker (or a stale `sending` one): this attempt owns the send.
    Proceed,
    /// A `sent` marker exists; the recipient already got their copy.
    AlreadySent,
    /// A fresh `sending` marker exists; a peer attempt is in flight.
    InFlight,
}

pub struct IdempotencyGuard {
    kv: Arc<dyn KvStore>,
    /// Age past which a `sending` marker is assumed abandoned.
    sending_stale_after: ChronoDuration,
}

impl IdempotencyGuard {
    pub fn new(kv: Arc<dyn KvStore>, sending_stale_after: ChronoDuration) -> Self {
        Self {
            kv,
            sending_stale_after,
        }
    }

    pub async fn claim(
        &self,
        capsule_id: &str,
        recipient: &str,
    ) -> Result<ClaimOutcome, DeliveryError> {
        let key = keys::marker_key(capsule_id, recipient);
        let existing = self.read_marker(&key).await?;

        if let Some(marker) = existing {
            match marker.state {
                MarkerState::Sent => {
                    debug!(capsule = %capsule_id, recipient = %recipient, "Recipient already sent");
                    return Ok(ClaimOutcome::AlreadySent);
                }
                MarkerState::Sending => {
                    let age = Utc::now() - marker.at;
                    if age < self.sending_stale_after {
                        debug!(
                            capsule = %capsule_id,
                            recipient = %recipient,
                            age_secs = age.num_seconds(),
                            "Another send attempt is in flight"
                        );
                        return Ok(ClaimOutcome::InFlight);
                    }
                    debug!(
                        capsule = %capsule_id,
                        recipient = %recipient,
                        age_secs = age.num_seconds(),
                        "Reclaiming stale sending marker"
                    );
                }
            }
        }

        let marker = DispatchMarker {
            state: MarkerState::Sending,
            at: Utc::now(),
            token: Uuid::new_v4().to_string(),
        };
        self.write_marker(&key, &marker).await?;
        Ok(ClaimOutcome::Proceed)
    }

    pub async fn mark_sent(&self, capsule_id: &str, recipient: &str) -> Result<(), DeliveryError> {
        let key = keys::marker_key(capsule_id, recipient);
        let marker = DispatchMarker {
            state: MarkerState::Sent,
            at: Utc::now(),
            token: Uuid::new_v4().to_string(),
        };
        self.write_marker(&key, &marker).await
    }

    /// Delete the marker after a failed send so a later retry proceeds.
    pub async fn release(&self, capsule_id: &str, recipient: &str) -> Result<(), DeliveryError> {
        let key = keys::marker_key(capsule_id, recipient);
        self.kv
            .delete(&key)
            .await
            .map_err(|source| DeliveryError::Marker { source })
    }

    pub async fn marker_state(
        &self,
        capsule_id: &str,
        recipient: &str,
    ) -> Result<Option<MarkerState>, DeliveryError> {
        let key = keys::marker_key(capsule_id, recipient);
        Ok(self.read_marker(&key).await?.map(|m| m.state))
    }

    async fn read_marker(&self, key: &str) -> Result<Option<DispatchMarker>, DeliveryError> {
        let value = self
            .kv
            .get(key)
            .await
            .map_err(|source| DeliveryError::Marker { source })?;
        match value {
            Some(raw) => serde_json::from_value(raw)
                .map(Some)
                .map_err(|source| DeliveryError::Marker {
                    source: StorageError::Deserialization {
                        data_type: "DispatchMarker".to_string(),
                        key: key.to_string(),
                        source,
                    },
                }),
            None => Ok(None),
        }
    }

    async fn write_marker(&self, key: &str, marker: &DispatchMarker) -> Result<(), DeliveryError> {
        let value =
            serde_json::to_value(marker).map_err(|source| DeliveryError::Marker {
                source: StorageError::Serialization {
                    data_type: "DispatchMarker".to_string(),
                    source,
                },
            })?;
        self.kv
            .set(key, &value)
            .await
            .map_err(|source| DeliveryError::Marker { source })
    }
}
