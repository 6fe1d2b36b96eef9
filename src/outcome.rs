//! Success bookkeeping and failure-to-draft conversion.
//!
//! There is no automatic retry ladder: the first failed delivery attempt
//! converts the capsule back to an editable draft (due date cleared,
//! failure reason attached) and scheduling stops until the user
//! re-schedules it. Media references must survive the conversion
//! exactly; any count mismatch aborts the conversion instead of
//! completing a lossy one.

use crate::delivery::resolve_recipients;
use crate::errors::OutcomeError;
use crate::hooks::{PostDeliveryHook, run_hooks};
use crate::storage::capsule::{Capsule, CapsuleStatus, CapsuleStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct OutcomePolicy {
    store: CapsuleStore,
    hooks: Vec<Arc<dyn PostDeliveryHook>>,
}

impl OutcomePolicy {
    pub fn new(store: CapsuleStore, hooks: Vec<Arc<dyn PostDeliveryHook>>) -> Self {
        Self { store, hooks }
    }

    /// Commit a successful delivery: terminal `delivered` status, index
    /// removal, recipient bookkeeping, then best-effort hooks.
    pub async fn on_success(
        &self,
        capsule: &Capsule,
        now: DateTime<Utc>,
    ) -> Result<(), OutcomeError> {
        let mut delivered = capsule.clone();
        delivered.status = CapsuleStatus::Delivered;
        delivered.delivered_at = Some(now);
        delivered.updated_at = now;
        delivered.failure_reason = None;

        self.store
            .put(&delivered)
            .await
            .map_err(|source| OutcomeError::Store {
                capsule_id: capsule.id.clone(),
                source,
            })?;
        self.store
            .remove_pending(&capsule.id)
            .await
            .map_err(|source| OutcomeError::Store {
                capsule_id: capsule.id.clone(),
                source,
            })?;

        // Recipient-list bookkeeping and gamification are best-effort:
        // the delivery already committed.
        if let Ok(recipients) = resolve_recipients(&delivered) {
            for recipient in recipients {
                if let Err(err) = self.store.add_received(&recipient.email, &capsule.id).await {
                    warn!(
                        capsule = %capsule.id,
                        recipient = %recipient.email,
                        error = %err,
                        "Received-index bookkeeping failed, continuing"
                    );
                }
            }
        }
        run_hooks(&self.hooks, &delivered).await;

        info!(capsule = %capsule.id, "Capsule delivered");
        Ok(())
    }

    /// Convert a failed capsule back to an editable draft.
    ///
    /// The media reference arrays are explicitly re-asserted from the
    /// pre-failure capsule and re-counted; a mismatch is a fatal
    /// data-integrity violation that leaves the capsule in `delivering`
    /// for manual inspection rather than silently losing attachments.
    pub async fn on_failure(
        &self,
        capsule: &Capsule,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OutcomeError> {
        let media_before = capsule.media_count();

        let mut draft = capsule.clone();
        draft.status = CapsuleStatus::Draft;
        draft.original_delivery_date = draft.due_at.take();
        draft.failure_reason = Some(reason.to_string());
        draft.failed_at = Some(now);
        draft.updated_at = now;
        draft.media_ids = capsule.media_ids.clone();
        draft.media_urls = capsule.media_urls.clone();

        let media_after = draft.media_count();
        if media_after != media_before {
            error!(
                capsule = %capsule.id,
                before = media_before,
                after = media_after,
                "Media references would be lost by draft conversion, aborting"
            );
            return Err(OutcomeError::MediaCountMismatch {
                capsule_id: capsule.id.clone(),
                before: media_before,
                after: media_after,
            });
        }

        self.store
            .put(&draft)
            .await
            .map_err(|source| OutcomeError::Store {
                capsule_id: capsule.id.clone(),
                source,
            })?;
        self.store
            .remove_pending(&capsule.id)
            .await
            .map_err(|source| OutcomeError::Store {
                capsule_id: capsule.id.clone(),
                source,
            })?;

        // Undo any partial received-index registration from this attempt.
        if let Ok(recipients) = resolve_recipients(capsule) {
            for recipient in recipients {
                if let Err(err) = self
                    .store
                    .remove_received(&recipient.email, &capsule.id)
                    .await
                {
                    warn!(
                        capsule = %capsule.id,
                        recipient = %recipient.email,
                        error = %err,
                        "Received-index cleanup failed, continuing"
                    );
                }
            }
        }

        info!(
            capsule = %capsule.id,
            reason = %reason,
            "Capsule converted to draft after failed delivery"
        );
        Ok(())
    }
}
