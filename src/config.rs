//! Configuration management for the eras-dispatch service.
//!
//! All configuration is loaded from environment variables by [`Config::new`].
//! Numeric values are validated on load so that a misconfigured instance
//! fails at startup rather than mid-cycle.

use crate::errors::ConfigError;

type Result<T> = std::result::Result<T, ConfigError>;

/// HTTP server port configuration.
///
/// Wraps a u16 port number for the HTTP trigger surface.
#[derive(Clone, Debug)]
pub struct HttpPort(u16);

impl HttpPort {
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl Default for HttpPort {
    fn default() -> Self {
        Self(8080)
    }
}

/// Email channel configuration.
///
/// The dispatcher sends mail through an external HTTP email API that is
/// queued and rate-limited on the provider side, so no client-side
/// throttling is configured here.
#[derive(Clone, Debug)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    /// From-address stamped on every outgoing capsule email.
    pub from_address: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
}

/// Blob store configuration for signed media URLs.
#[derive(Clone, Debug)]
pub struct BlobConfig {
    pub api_url: String,
    pub bucket: String,
    /// Lifetime of signed media links embedded in outgoing mail.
    pub signed_url_ttl_secs: u64,
}

/// Thresholds governing lock, marker, and stuck-state reclamation.
///
/// All values are wall-clock ages compared in absolute time. A record
/// older than its threshold is treated as abandoned by a crashed worker
/// and becomes reclaimable without explicit release.
#[derive(Clone, Debug)]
pub struct StalenessConfig {
    /// Age after which a lock record is reclaimable.
    pub lock_stale_secs: u64,
    /// Age after which a `sending` idempotency marker is reclaimable.
    pub marker_stale_secs: u64,
    /// Age after which a capsule stuck in `delivering` is reset to
    /// `scheduled`.
    pub stuck_delivering_secs: u64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            lock_stale_secs: 120,
            marker_stale_secs: 600,
            stuck_delivering_secs: 600,
        }
    }
}

/// Cycle execution limits.
#[derive(Clone, Debug)]
pub struct CycleConfig {
    /// Capsule fetches per batch during a scan.
    pub batch_size: usize,
    /// Pause between scan batches in milliseconds, bounding concurrent
    /// load on the store.
    pub batch_pause_ms: u64,
    /// Safety cap on capsules processed per cycle.
    pub max_per_cycle: usize,
    /// Per-operation store/network timeout in milliseconds.
    pub op_timeout_ms: u64,
    /// Lock acquisition timeout in milliseconds.
    pub lock_acquire_timeout_ms: u64,
    /// Interval between background dispatch cycles in seconds. Zero
    /// disables the background loop (cycles run only via POST /dispatch).
    pub interval_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_pause_ms: 200,
            max_per_cycle: 50,
            op_timeout_ms: 5000,
            lock_acquire_timeout_ms: 3000,
            interval_secs: 60,
        }
    }
}

/// Top-level service configuration loaded from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub version: String,
    pub http_port: HttpPort,
    pub redis_url: String,
    /// When true, cycles scan and lock but perform no capsule mutation,
    /// email, blob, or hook side effects; every would-be action is logged.
    pub dry_run: bool,
    pub cycle: CycleConfig,
    pub staleness: StalenessConfig,
    /// Absent only in dry-run mode.
    pub email: Option<EmailConfig>,
    /// Absent when no media signing endpoint is configured; capsules with
    /// media ids then fail delivery with a descriptive reason.
    pub blob: Option<BlobConfig>,
    /// Optional statsd endpoint, e.g. "127.0.0.1:8125".
    pub statsd_addr: Option<String>,
}

/// Service version from build-time package metadata.
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn require_var(var_name: &str) -> Result<String> {
    std::env::var(var_name).map_err(|_| ConfigError::EnvVarRequired {
        var_name: var_name.to_string(),
    })
}

fn optional_var(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(var_name: &str, default: T) -> Result<T> {
    match std::env::var(var_name) {
        Ok(value) => value.parse::<T>().map_err(|_| ConfigError::InvalidNumber {
            var_name: var_name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn bool_var(var_name: &str) -> bool {
    std::env::var(var_name)
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(false)
}

impl Config {
    pub fn new() -> Result<Self> {
        let dry_run = bool_var("ERAS_DRY_RUN");

        let http_port = match optional_var("HTTP_PORT") {
            Some(value) => HttpPort(value.parse::<u16>().map_err(|_| {
                ConfigError::InvalidPortNumber { port: value }
            })?),
            None => HttpPort::default(),
        };

        let redis_url = require_var("REDIS_URL")?;

        let defaults = CycleConfig::default();
        let cycle = CycleConfig {
            batch_size: parse_var("ERAS_BATCH_SIZE", defaults.batch_size)?.max(1),
            batch_pause_ms: parse_var("ERAS_BATCH_PAUSE_MS", defaults.batch_pause_ms)?,
            max_per_cycle: parse_var("ERAS_MAX_PER_CYCLE", defaults.max_per_cycle)?.max(1),
            op_timeout_ms: parse_var("ERAS_OP_TIMEOUT_MS", defaults.op_timeout_ms)?.max(100),
            lock_acquire_timeout_ms: parse_var(
                "ERAS_LOCK_ACQUIRE_TIMEOUT_MS",
                defaults.lock_acquire_timeout_ms,
            )?
            .max(100),
            interval_secs: parse_var("ERAS_CYCLE_INTERVAL_SECS", defaults.interval_secs)?,
        };

        let stale_defaults = StalenessConfig::default();
        let staleness = StalenessConfig {
            lock_stale_secs: parse_var("ERAS_LOCK_STALE_SECS", stale_defaults.lock_stale_secs)?,
            marker_stale_secs: parse_var(
                "ERAS_MARKER_STALE_SECS",
                stale_defaults.marker_stale_secs,
            )?,
            stuck_delivering_secs: parse_var(
                "ERAS_STUCK_DELIVERING_SECS",
                stale_defaults.stuck_delivering_secs,
            )?,
        };
        staleness_check(&staleness, &cycle)?;

        let email = match (optional_var("EMAIL_API_URL"), optional_var("EMAIL_API_KEY")) {
            (Some(api_url), Some(api_key)) => {
                validate_url("EMAIL_API_URL", &api_url)?;
                Some(EmailConfig {
                    api_url,
                    api_key,
                    from_address: optional_var("EMAIL_FROM_ADDRESS")
                        .unwrap_or_else(|| "capsules@eras.app".to_string()),
                    timeout_ms: parse_var("EMAIL_TIMEOUT_MS", 10_000u64)?,
                })
            }
            _ if dry_run => None,
            _ => return Err(ConfigError::EmailChannelRequired),
        };

        let blob = match optional_var("BLOB_API_URL") {
            Some(api_url) => {
                validate_url("BLOB_API_URL", &api_url)?;
                Some(BlobConfig {
                    api_url,
                    bucket: optional_var("BLOB_BUCKET")
                        .unwrap_or_else(|| "capsule-media".to_string()),
                    signed_url_ttl_secs: parse_var("BLOB_SIGNED_URL_TTL_SECS", 86_400u64)?,
                })
            }
            None => None,
        };

        Ok(Self {
            version: version(),
            http_port,
            redis_url,
            dry_run,
            cycle,
            staleness,
            email,
            blob,
            statsd_addr: optional_var("STATSD_ADDR"),
        })
    }

    pub fn mode(&self) -> &'static str {
        if self.dry_run { "dry-run" } else { "production" }
    }
}

fn validate_url(var_name: &str, value: &str) -> Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl {
            var_name: var_name.to_string(),
            value: value.to_string(),
        })
    }
}

/// A lock that can go stale faster than a claimant can acquire it is a
/// misconfiguration that invites double-holders.
fn staleness_check(staleness: &StalenessConfig, cycle: &CycleConfig) -> Result<()> {
    if staleness.lock_stale_secs * 1000 <= cycle.lock_acquire_timeout_ms {
        return Err(ConfigError::InvalidThreshold {
            details: format!(
                "lock staleness ({}s) must exceed the acquisition timeout ({}ms)",
                staleness.lock_stale_secs, cycle.lock_acquire_timeout_ms
            ),
        });
    }
    if staleness.marker_stale_secs == 0 || staleness.stuck_delivering_secs == 0 {
        return Err(ConfigError::InvalidThreshold {
            details: "marker and stuck-delivering thresholds must be non-zero".to_string(),
        });
    }
    Ok(())
}
