//! Due-capsule scanner.
//!
//! Walks the pending index in small batches, re-fetches every referenced
//! capsule (the index is never trusted for status), and returns the
//! capsules that are due now. Terminal entries are pruned lazily,
//! capsules stuck in `delivering` past a threshold are reset to
//! `scheduled`, and malformed due dates are surfaced as corrupt so the
//! dispatcher can convert them to drafts with a reason.

use crate::storage::capsule::{Capsule, CapsuleStatus, CapsuleStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one scan pass. Output ordering is index order, not
/// priority order; consumers must not assume FIFO.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Capsules due for delivery now.
    pub due: Vec<Capsule>,
    /// Capsules with unparseable due dates, with the parse failure.
    pub corrupt: Vec<(Capsule, String)>,
    /// Index entries pruned (missing records, terminal statuses).
    pub pruned: usize,
    /// True when a transient store failure aborted the remaining
    /// batches; the collected results are still valid.
    pub aborted: bool,
}

pub struct DueScanner {
    store: CapsuleStore,
    batch_size: usize,
    batch_pause: Duration,
    stuck_after: ChronoDuration,
    /// When false (dry-run cycles), the scan is read-only: stuck
    /// `delivering` capsules are reported but not reset, and prunable
    /// index entries are left in place.
    repair: bool,
}

impl DueScanner {
    pub fn new(
        store: CapsuleStore,
        batch_size: usize,
        batch_pause: Duration,
        stuck_after: ChronoDuration,
        repair: bool,
    ) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            batch_pause,
            stuck_after,
            repair,
        }
    }

    /// Scan the pending index for capsules due at `now`.
    ///
    /// A failure to read the index itself yields zero progress; a
    /// transient failure mid-scan aborts the remaining batches rather
    /// than continuing to hammer a failing store.
    pub async fn list_due(&self, now: DateTime<Utc>) -> crate::storage::StorageResult<ScanOutcome> {
        let ids = self.store.pending_ids().await?;
        let mut outcome = ScanOutcome::default();

        if ids.is_empty() {
            return Ok(outcome);
        }
        debug!(pending = ids.len(), "Scanning pending index");

        let mut to_prune: Vec<String> = Vec::new();
        let mut batches = ids.chunks(self.batch_size).peekable();

        'batches: while let Some(batch) = batches.next() {
            for id in batch {
                match self.store.get(id).await {
                    Ok(Some(capsule)) => {
                        self.classify(capsule, now, &mut outcome, &mut to_prune)
                            .await;
                    }
                    Ok(None) => {
                        debug!(capsule = %id, "Pending index references missing capsule, pruning");
                        to_prune.push(id.clone());
                    }
                    Err(err) if err.is_transient() => {
                        warn!(capsule = %id, error = %err, "Transient store failure, aborting scan");
                        outcome.aborted = true;
                        break 'batches;
                    }
                    Err(err) => {
                        // Record-level corruption: no safe automated
                        // conversion exists, leave it for inspection.
                        warn!(capsule = %id, error = %err, "Unreadable capsule record, skipping");
                    }
                }
            }

            if batches.peek().is_some() && !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
        }

        if self.repair {
            for id in &to_prune {
                if let Err(err) = self.store.remove_pending(id).await {
                    warn!(capsule = %id, error = %err, "Failed to prune pending index entry");
                } else {
                    outcome.pruned += 1;
                }
            }
        } else if !to_prune.is_empty() {
            debug!(
                prunable = to_prune.len(),
                "Read-only scan, leaving prunable index entries in place"
            );
        }

        if !outcome.due.is_empty() || !outcome.corrupt.is_empty() || outcome.pruned > 0 {
            info!(
                due = outcome.due.len(),
                corrupt = outcome.corrupt.len(),
                pruned = outcome.pruned,
                aborted = outcome.aborted,
                "Scan complete"
            );
        }

        Ok(outcome)
    }

    async fn classify(
        &self,
        mut capsule: Capsule,
        now: DateTime<Utc>,
        outcome: &mut ScanOutcome,
        to_prune: &mut Vec<String>,
    ) {
        // Soft-deleted capsules are never dispatched, due or not.
        if capsule.deleted {
            debug!(capsule = %capsule.id, "Skipping deleted capsule");
            return;
        }

        match capsule.status {
            CapsuleStatus::Delivered | CapsuleStatus::Draft => {
                debug!(capsule = %capsule.id, status = ?capsule.status, "Pruning terminal capsule from index");
                to_prune.push(capsule.id.clone());
                return;
            }
            CapsuleStatus::Delivering => {
                let age = capsule
                    .last_attempt_at
                    .map(|at| now - at)
                    .unwrap_or(self.stuck_after);
                if age < self.stuck_after {
                    debug!(capsule = %capsule.id, "Skipping in-flight capsule");
                    return;
                }
                if !self.repair {
                    debug!(capsule = %capsule.id, "Stuck capsule observed, repair disabled");
                    return;
                }
                // Abandoned by a crashed worker; reset so it can run again.
                warn!(
                    capsule = %capsule.id,
                    age_secs = age.num_seconds(),
                    "Resetting capsule stuck in delivering"
                );
                capsule.status = CapsuleStatus::Scheduled;
                capsule.updated_at = now;
                if let Err(err) = self.store.put(&capsule).await {
                    warn!(capsule = %capsule.id, error = %err, "Failed to reset stuck capsule");
                    return;
                }
            }
            CapsuleStatus::Scheduled => {}
        }

        match capsule.due_instant() {
            Ok(Some(due_at)) => {
                // Strictly at-or-after; never fire early.
                if due_at <= now {
                    outcome.due.push(capsule);
                }
            }
            Ok(None) => {
                debug!(capsule = %capsule.id, "Scheduled capsule has no due date, skipping");
            }
            Err(reason) => {
                warn!(capsule = %capsule.id, reason = %reason, "Corrupt due date");
                outcome.corrupt.push((capsule, reason));
            }
        }
    }
}
