//! Dispatch cycle orchestration.
//!
//! The dispatcher is invoked periodically (background loop or POST
//! trigger) as a short-lived, possibly-concurrent process; overlapping
//! invocations are assumed and coordinated only through the lock manager
//! and idempotency markers. A cycle that cannot confirm exclusivity, or
//! that hits a failing store, returns a zero-progress summary rather
//! than proceeding unprotected.

use crate::config::Config;
use crate::delivery::DeliveryExecutor;
use crate::errors::OutcomeError;
use crate::lock::LockManager;
use crate::metrics::{MetricsPublisher, keys as metric_keys};
use crate::outcome::OutcomePolicy;
use crate::scanner::DueScanner;
use crate::storage::capsule::{Capsule, CapsuleStatus, CapsuleStore, keys};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// JSON summary returned by a dispatch cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleSummary {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_seconds: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub dry_run: bool,
}

impl CycleSummary {
    fn skipped(reason: &str, dry_run: bool) -> Self {
        Self {
            warnings: vec![reason.to_string()],
            dry_run,
            ..Self::default()
        }
    }
}

pub struct Dispatcher {
    store: CapsuleStore,
    locks: LockManager,
    scanner: DueScanner,
    executor: DeliveryExecutor,
    policy: OutcomePolicy,
    metrics: Arc<dyn MetricsPublisher>,
    lock_stale: ChronoDuration,
    max_per_cycle: usize,
    dry_run: bool,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: CapsuleStore,
        locks: LockManager,
        scanner: DueScanner,
        executor: DeliveryExecutor,
        policy: OutcomePolicy,
        metrics: Arc<dyn MetricsPublisher>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            locks,
            scanner,
            executor,
            policy,
            metrics,
            lock_stale: ChronoDuration::seconds(config.staleness.lock_stale_secs as i64),
            max_per_cycle: config.cycle.max_per_cycle,
            dry_run: config.dry_run,
        }
    }

    /// Run one dispatch cycle at `now`.
    ///
    /// Errors from one capsule never abort processing of siblings; they
    /// are collected into the summary.
    #[instrument(skip_all, fields(holder = %self.locks.holder_id(), dry_run = self.dry_run))]
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleSummary {
        let started = std::time::Instant::now();
        self.metrics.incr(metric_keys::CYCLES).await;

        let cycle_lock = keys::cycle_lock_key();
        match self.locks.try_acquire(&cycle_lock, self.lock_stale).await {
            Ok(attempt) if attempt.acquired => {}
            Ok(attempt) => {
                self.metrics.incr(metric_keys::CYCLE_SKIPPED).await;
                debug!(holder = ?attempt.current_holder, "Cycle lock held elsewhere, skipping");
                return CycleSummary::skipped(
                    "another instance holds the cycle lock",
                    self.dry_run,
                );
            }
            Err(err) => {
                self.metrics.incr(metric_keys::CYCLE_SKIPPED).await;
                warn!(error = %err, "Could not confirm cycle exclusivity, skipping");
                return CycleSummary::skipped(
                    "cycle lock acquisition could not be confirmed",
                    self.dry_run,
                );
            }
        }

        let mut summary = self.run_cycle_locked(now).await;

        if let Err(err) = self.locks.release(&cycle_lock).await {
            warn!(error = %err, "Cycle lock release failed (will expire by staleness)");
        }

        summary.duration_seconds = started.elapsed().as_secs_f64();
        self.metrics
            .time(
                metric_keys::CYCLE_DURATION,
                started.elapsed().as_millis() as u64,
            )
            .await;
        info!(
            processed = summary.processed,
            successful = summary.successful,
            failed = summary.failed,
            duration_seconds = summary.duration_seconds,
            "Dispatch cycle complete"
        );
        summary
    }

    async fn run_cycle_locked(&self, now: DateTime<Utc>) -> CycleSummary {
        let mut summary = CycleSummary {
            dry_run: self.dry_run,
            ..CycleSummary::default()
        };

        let scan = match self.scanner.list_due(now).await {
            Ok(scan) => scan,
            Err(err) => {
                warn!(error = %err, "Pending index scan failed, zero-progress cycle");
                summary
                    .warnings
                    .push(format!("pending index scan failed: {}", err));
                return summary;
            }
        };
        if scan.aborted {
            summary
                .warnings
                .push("scan aborted early on transient store failure".to_string());
        }

        // Corrupt due dates are pushed straight to draft conversion so a
        // human can fix them, instead of being silently skipped forever.
        // They spend the same per-cycle budget as ordinary deliveries.
        let mut corrupt = scan.corrupt;
        if corrupt.len() > self.max_per_cycle {
            summary.warnings.push(format!(
                "corrupt capsules truncated to safety cap ({} of {})",
                self.max_per_cycle,
                corrupt.len()
            ));
            corrupt.truncate(self.max_per_cycle);
        }
        let budget = self.max_per_cycle.saturating_sub(corrupt.len());
        for (capsule, reason) in corrupt {
            summary.processed += 1;
            if self.dry_run {
                info!(capsule = %capsule.id, reason = %reason, "[dry-run] would convert corrupt capsule to draft");
                continue;
            }
            match self.convert_corrupt(&capsule, &reason, now).await {
                Ok(true) => summary.failed += 1,
                Ok(false) => summary.processed -= 1,
                Err(err) => {
                    summary.failed += 1;
                    summary.errors.push(err);
                }
            }
        }

        let mut due = scan.due;
        if due.len() > budget {
            summary.warnings.push(format!(
                "due capsules truncated to safety cap ({} of {})",
                budget,
                due.len()
            ));
            due.truncate(budget);
        }

        for capsule in due {
            summary.processed += 1;
            match self.process_capsule(capsule, now).await {
                CapsuleResult::Delivered => summary.successful += 1,
                CapsuleResult::Failed(reason) => {
                    summary.failed += 1;
                    summary.errors.push(reason);
                }
                CapsuleResult::Skipped(reason) => {
                    // A peer instance is handling it; success-equivalent.
                    summary.processed -= 1;
                    debug!(reason = %reason, "Capsule skipped");
                }
                CapsuleResult::DryRun => summary.successful += 1,
            }
        }

        self.metrics
            .count(metric_keys::PROCESSED, summary.processed as u64)
            .await;
        self.metrics
            .count(metric_keys::DELIVERED, summary.successful as u64)
            .await;
        self.metrics
            .count(metric_keys::FAILED, summary.failed as u64)
            .await;
        summary
    }

    /// Returns `Ok(false)` when a peer holds the capsule lock and the
    /// conversion was left to them.
    async fn convert_corrupt(
        &self,
        capsule: &Capsule,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        let lock_key = keys::capsule_lock_key(&capsule.id);
        match self.locks.try_acquire(&lock_key, self.lock_stale).await {
            Ok(attempt) if attempt.acquired => {}
            _ => return Ok(false),
        }

        let result = self
            .policy
            .on_failure(capsule, &format!("unschedulable: {}", reason), now)
            .await
            .map(|()| true)
            .map_err(|e| e.to_string());

        if let Err(err) = self.locks.release(&lock_key).await {
            warn!(capsule = %capsule.id, error = %err, "Capsule lock release failed");
        }
        result
    }

    async fn process_capsule(&self, capsule: Capsule, now: DateTime<Utc>) -> CapsuleResult {
        let lock_key = keys::capsule_lock_key(&capsule.id);
        match self.locks.try_acquire(&lock_key, self.lock_stale).await {
            Ok(attempt) if attempt.acquired => {}
            Ok(_) => {
                self.metrics.incr(metric_keys::LOCK_CONTENTION).await;
                return CapsuleResult::Skipped("capsule lock held by peer".to_string());
            }
            Err(err) => {
                self.metrics.incr(metric_keys::LOCK_CONTENTION).await;
                return CapsuleResult::Skipped(format!("capsule lock unconfirmed: {}", err));
            }
        }

        let result = self.process_locked(&capsule, now).await;

        if let Err(err) = self.locks.release(&lock_key).await {
            warn!(capsule = %capsule.id, error = %err, "Capsule lock release failed");
        }
        result
    }

    async fn process_locked(&self, capsule: &Capsule, now: DateTime<Utc>) -> CapsuleResult {
        // Re-verify the authoritative record under the lock; a peer may
        // have finished this capsule between scan and lock.
        let current = match self.store.get(&capsule.id).await {
            Ok(Some(current)) => current,
            Ok(None) => return CapsuleResult::Skipped("capsule vanished".to_string()),
            Err(err) => return CapsuleResult::Skipped(format!("re-fetch failed: {}", err)),
        };
        if current.status != CapsuleStatus::Scheduled || current.deleted {
            return CapsuleResult::Skipped(format!(
                "no longer dispatchable (status {:?})",
                current.status
            ));
        }

        if self.dry_run {
            match self.executor.plan_recipients(&current) {
                Ok(recipients) => {
                    for recipient in recipients {
                        info!(
                            capsule = %current.id,
                            recipient = %recipient.email,
                            self_addressed = recipient.self_addressed,
                            "[dry-run] would send capsule email"
                        );
                    }
                }
                Err(err) => {
                    info!(capsule = %current.id, error = %err, "[dry-run] would convert to draft");
                }
            }
            return CapsuleResult::DryRun;
        }

        let mut delivering = current.clone();
        delivering.status = CapsuleStatus::Delivering;
        delivering.attempt_count += 1;
        delivering.last_attempt_at = Some(now);
        delivering.updated_at = now;
        if let Err(err) = self.store.put(&delivering).await {
            return CapsuleResult::Skipped(format!("could not mark delivering: {}", err));
        }

        let (success, failure_reason) = match self.executor.deliver(&delivering).await {
            Ok(report) => {
                if report.skipped > 0 {
                    self.metrics
                        .count(metric_keys::IDEMPOTENT_SKIPS, report.skipped as u64)
                        .await;
                }
                if report.all_sent() {
                    (true, None)
                } else {
                    (false, Some(report.failures.join("; ")))
                }
            }
            Err(err) if err.is_transient() => {
                // The marker store may recover by the next cycle; leaving
                // the capsule in `delivering` lets the stuck-threshold
                // reset re-schedule it instead of drafting it.
                warn!(capsule = %capsule.id, error = %err, "Transient store failure during delivery, leaving in flight");
                return CapsuleResult::Skipped(format!("transient store failure: {}", err));
            }
            Err(err) => (false, Some(err.to_string())),
        };

        if success {
            match self.policy.on_success(&delivering, now).await {
                Ok(()) => CapsuleResult::Delivered,
                Err(err) => {
                    error!(capsule = %capsule.id, error = %err, "Delivered but bookkeeping failed");
                    CapsuleResult::Failed(err.to_string())
                }
            }
        } else {
            let reason = failure_reason.unwrap_or_else(|| "delivery failed".to_string());
            match self.policy.on_failure(&delivering, &reason, now).await {
                Ok(()) => CapsuleResult::Failed(reason),
                Err(OutcomeError::MediaCountMismatch { .. }) => {
                    // Integrity violation: capsule intentionally left in
                    // `delivering` for manual inspection.
                    CapsuleResult::Failed(format!(
                        "draft conversion aborted for {}: media references would be lost",
                        capsule.id
                    ))
                }
                Err(err) => CapsuleResult::Failed(err.to_string()),
            }
        }
    }
}

enum CapsuleResult {
    Delivered,
    Failed(String),
    Skipped(String),
    DryRun,
}

/// Background task that runs dispatch cycles on a fixed interval.
///
/// Mirrors the external-scheduler model: each tick is an independent
/// cycle, and the cycle lock keeps overlapping instances honest.
pub struct DispatcherTask {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    cancel_token: CancellationToken,
}

impl DispatcherTask {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            interval,
            cancel_token,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(self) -> anyhow::Result<()> {
        info!(interval_secs = self.interval.as_secs(), "Starting dispatch loop");

        while !self.cancel_token.is_cancelled() {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {
                    let summary = self.dispatcher.run_cycle(Utc::now()).await;
                    if !summary.errors.is_empty() {
                        warn!(errors = ?summary.errors, "Dispatch cycle reported errors");
                    }
                }
                () = self.cancel_token.cancelled() => {
                    info!("Dispatch loop cancelled");
                    break;
                }
            }
        }

        info!("Dispatch loop stopped");
        Ok(())
    }
}
