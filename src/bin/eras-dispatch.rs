use anyhow::Result;
use chrono::Duration as ChronoDuration;
use eras_dispatch::{
    config::Config,
    delivery::DeliveryExecutor,
    dispatcher::{Dispatcher, DispatcherTask},
    email::{EmailChannel, HttpEmailChannel, RecordingEmailChannel},
    hooks::{AchievementHook, NotificationHook, PostDeliveryHook},
    http::{context::WebContext, server::build_router},
    idempotency::IdempotencyGuard,
    lock::LockManager,
    metrics::{MetricsPublisher, NoOpMetricsPublisher, StatsdMetricsPublisher},
    outcome::OutcomePolicy,
    scanner::DueScanner,
    storage::blob::{BlobStore, HttpBlobStore},
    storage::capsule::CapsuleStore,
    storage::kv::{KvStore, RedisKvStore, create_kv_pool},
    tasks::spawn_cancellable_task,
};
use std::{env, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let version = eras_dispatch::config::version();

    env::args().for_each(|arg| {
        if arg == "--version" {
            println!("{version}");
            std::process::exit(0);
        }
    });

    let config = Config::new()?;

    {
        use tracing_subscriber::prelude::*;

        let env_filter = tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "eras_dispatch=info,tower_http=info".into()),
        );

        let fmt_layer = if std::env::var("JSON_LOGS").is_ok() {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer().pretty().boxed()
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    tracing::info!(version = %version, mode = config.mode(), "Starting eras-dispatch");

    let pool = create_kv_pool(&config.redis_url)?;
    let kv: Arc<dyn KvStore> = Arc::new(RedisKvStore::new(
        pool,
        Duration::from_millis(config.cycle.op_timeout_ms),
    ));

    let http_client = reqwest::Client::new();

    let email: Arc<dyn EmailChannel> = match &config.email {
        Some(email_config) => Arc::new(HttpEmailChannel::new(
            http_client.clone(),
            email_config.api_url.clone(),
            email_config.api_key.clone(),
            email_config.from_address.clone(),
            Duration::from_millis(email_config.timeout_ms),
        )),
        None => {
            // Config::new rejects this combination outside dry-run.
            tracing::warn!("No email provider configured; sends are recorded in memory only");
            Arc::new(RecordingEmailChannel::new())
        }
    };

    let blob: Option<Arc<dyn BlobStore>> = config.blob.as_ref().map(|blob_config| {
        Arc::new(HttpBlobStore::new(
            http_client.clone(),
            blob_config.api_url.clone(),
            Duration::from_millis(config.cycle.op_timeout_ms),
        )) as Arc<dyn BlobStore>
    });
    let (blob_bucket, signed_url_ttl_secs) = config
        .blob
        .as_ref()
        .map(|b| (b.bucket.clone(), b.signed_url_ttl_secs))
        .unwrap_or_default();

    let metrics: Arc<dyn MetricsPublisher> = match &config.statsd_addr {
        Some(addr) => Arc::new(StatsdMetricsPublisher::new(addr, "eras")?),
        None => Arc::new(NoOpMetricsPublisher),
    };

    let holder_id = format!("eras-dispatch-{}", Uuid::new_v4());
    let store = CapsuleStore::new(kv.clone());
    let locks = LockManager::new(
        kv.clone(),
        holder_id,
        Duration::from_millis(config.cycle.lock_acquire_timeout_ms),
    );
    let scanner = DueScanner::new(
        store.clone(),
        config.cycle.batch_size,
        Duration::from_millis(config.cycle.batch_pause_ms),
        ChronoDuration::seconds(config.staleness.stuck_delivering_secs as i64),
        !config.dry_run,
    );
    let guard = Arc::new(IdempotencyGuard::new(
        kv.clone(),
        ChronoDuration::seconds(config.staleness.marker_stale_secs as i64),
    ));
    let executor = DeliveryExecutor::new(guard, email, blob, blob_bucket, signed_url_ttl_secs);
    let hooks: Vec<Arc<dyn PostDeliveryHook>> = vec![
        Arc::new(NotificationHook::new(kv.clone())),
        Arc::new(AchievementHook::new(kv.clone())),
    ];
    let policy = OutcomePolicy::new(store.clone(), hooks);
    let dispatcher = Arc::new(Dispatcher::new(
        store, locks, scanner, executor, policy, metrics, &config,
    ));

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Signal handler
    {
        let signal_tracker = tracker.clone();
        let signal_token = token.clone();

        tokio::spawn(async move {
            let ctrl_c = async {
                signal::ctrl_c()
                    .await
                    .expect("failed to install Ctrl+C handler");
            };

            #[cfg(unix)]
            let terminate = async {
                signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install signal handler")
                    .recv()
                    .await;
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                () = signal_token.cancelled() => {
                    tracing::info!("Signal handler shutting down");
                },
                _ = terminate => {
                    tracing::info!("Received SIGTERM, initiating shutdown");
                },
                _ = ctrl_c => {
                    tracing::info!("Received Ctrl+C, initiating shutdown");
                },
            }

            signal_tracker.close();
            signal_token.cancel();
        });
    }

    // Background dispatch loop; interval 0 means HTTP-triggered only.
    if config.cycle.interval_secs > 0 {
        let loop_dispatcher = dispatcher.clone();
        let interval = Duration::from_secs(config.cycle.interval_secs);
        spawn_cancellable_task(&tracker, token.clone(), move |cancel_token| async move {
            DispatcherTask::new(loop_dispatcher, interval, cancel_token)
                .run()
                .await
        });
    } else {
        tracing::info!("Background dispatch loop disabled; cycles run on POST /dispatch only");
    }

    // HTTP server
    {
        let port = config.http_port.as_u16();
        let router = build_router(WebContext::new(config, dispatcher, kv));

        spawn_cancellable_task(&tracker, token.clone(), move |cancel_token| async move {
            let listener = TcpListener::bind(format!("0.0.0.0:{}", port))
                .await
                .map_err(|e| anyhow::anyhow!("Failed to bind to port {}: {}", port, e))?;

            tracing::info!(port = port, "HTTP server listening");

            let shutdown_token = cancel_token.clone();
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_token.cancelled().await;
                })
                .await
                .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

            Ok(())
        });
    }

    tracker.wait().await;
    tracing::info!("All tasks completed, shutting down");

    Ok(())
}
