//! Metrics publishing for dispatcher observability.
//!
//! A thin trait over statsd-style counters and timings so the dispatcher
//! can be instrumented without requiring a metrics backend in tests or
//! small deployments.

use async_trait::async_trait;
use cadence::{BufferedUdpMetricSink, Counted, QueuingMetricSink, StatsdClient, Timed};
use std::net::UdpSocket;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("error-eras-metrics-1 Statsd client creation failed: {details}")]
    ClientCreationFailed { details: String },
}

#[async_trait]
pub trait MetricsPublisher: Send + Sync {
    /// Increment a counter by 1.
    async fn incr(&self, key: &str);

    /// Increment a counter by a specific value.
    async fn count(&self, key: &str, value: u64);

    /// Record a timing in milliseconds.
    async fn time(&self, key: &str, millis: u64);
}

/// No-op implementation for development and testing.
#[derive(Debug, Clone, Default)]
pub struct NoOpMetricsPublisher;

#[async_trait]
impl MetricsPublisher for NoOpMetricsPublisher {
    async fn incr(&self, _key: &str) {}
    async fn count(&self, _key: &str, _value: u64) {}
    async fn time(&self, _key: &str, _millis: u64) {}
}

/// Statsd publisher backed by cadence with a queuing UDP sink.
pub struct StatsdMetricsPublisher {
    client: Arc<StatsdClient>,
}

impl StatsdMetricsPublisher {
    pub fn new(statsd_addr: &str, prefix: &str) -> Result<Self, MetricsError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| {
            MetricsError::ClientCreationFailed {
                details: e.to_string(),
            }
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| MetricsError::ClientCreationFailed {
                details: e.to_string(),
            })?;

        let udp_sink = BufferedUdpMetricSink::from(statsd_addr, socket).map_err(|e| {
            MetricsError::ClientCreationFailed {
                details: e.to_string(),
            }
        })?;
        let sink = QueuingMetricSink::from(udp_sink);
        let client = StatsdClient::from_sink(prefix, sink);

        debug!(addr = %statsd_addr, prefix = %prefix, "Statsd metrics publisher created");
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait]
impl MetricsPublisher for StatsdMetricsPublisher {
    async fn incr(&self, key: &str) {
        let _ = self.client.count(key, 1);
    }

    async fn count(&self, key: &str, value: u64) {
        let _ = self.client.count(key, value as i64);
    }

    async fn time(&self, key: &str, millis: u64) {
        let _ = self.client.time(key, millis);
    }
}

/// Metric key constants used by the dispatcher.
pub mod keys {
    pub const CYCLES: &str = "dispatch.cycles";
    pub const CYCLE_SKIPPED: &str = "dispatch.cycles.skipped";
    pub const CYCLE_DURATION: &str = "dispatch.cycle.duration_ms";
    pub const PROCESSED: &str = "dispatch.capsules.processed";
    pub const DELIVERED: &str = "dispatch.capsules.delivered";
    pub const FAILED: &str = "dispatch.capsules.failed";
    pub const LOCK_CONTENTION: &str = "dispatch.lock.contention";
    pub const IDEMPOTENT_SKIPS: &str = "dispatch.idempotent_skips";
}
