//! # eras-dispatch
//!
//! eras-dispatch is the delivery engine for Eras time capsules: messages
//! written now and delivered to their recipients at a chosen future
//! moment. It periodically scans a pending index for capsules whose due
//! instant has passed and delivers each one by email, exactly once per
//! recipient, even with several dispatcher instances running against the
//! same store.
//!
//! ## Architecture Overview
//!
//! The backing key-value store offers only get/set/delete, so every
//! coordination primitive is built on write-then-verify:
//!
//! - **Locks** ([`lock`]) claim a key with a unique token and re-read it;
//!   only the token that survives the re-read owns the lock. Locks expire
//!   by age, never requiring explicit release from a crashed holder.
//! - **Idempotency markers** ([`idempotency`]) record per
//!   (capsule, recipient) progress: a persistent `sent` marker suppresses
//!   any later send attempt, while a stale `sending` marker is reclaimed.
//! - **The scanner** ([`scanner`]) walks the pending index in small
//!   batches, pruning dead entries and healing capsules stuck in
//!   `delivering` by a crashed peer.
//! - **The dispatcher** ([`dispatcher`]) orchestrates one cycle: cycle
//!   lock, scan, per-capsule lock, delivery, then success bookkeeping or
//!   failure-to-draft conversion ([`outcome`]).
//!
//! There is no automatic retry ladder: a failed delivery converts the
//! capsule back to an editable draft with its failure reason attached,
//! preserving every media reference, and waits for the user to
//! re-schedule it.
//!
//! ## Configuration
//!
//! The service is configured via environment variables; see [`config`].
//! Key variables include `REDIS_URL` (required), `ERAS_DRY_RUN`, the
//! `EMAIL_*` provider settings, and the staleness thresholds.
//!
//! ## Error Handling
//!
//! All error strings use the format: `error-eras-<domain>-<number> <message>: <details>`

/// Environment-driven configuration with validated thresholds.
pub mod config;

/// Per-recipient delivery execution: recipient resolution, media link
/// signing, and idempotency-guarded sends.
pub mod delivery;

/// Cycle orchestration and the background dispatch loop.
pub mod dispatcher;

/// Outbound email channel abstractions and the HTTP provider client.
pub mod email;

/// Error taxonomy shared across the crate.
pub mod errors;

/// Best-effort hooks that run after a delivery commits.
pub mod hooks;

/// HTTP trigger and status surface.
pub mod http;

/// Per-(capsule, recipient) at-most-once markers.
pub mod idempotency;

/// Time-boxed exclusive locks over a non-atomic key-value store.
pub mod lock;

/// Metrics publishing for dispatcher observability.
pub mod metrics;

/// Delivery outcome policy: success bookkeeping and draft conversion.
pub mod outcome;

/// Capsule email rendering.
pub mod render;

/// Due-capsule scanning over the pending index.
pub mod scanner;

/// Storage layer: key-value trait, capsule records, blob signing.
pub mod storage;

/// Background task spawning utilities.
pub mod tasks;
