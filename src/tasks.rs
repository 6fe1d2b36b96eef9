//! Background task spawning with consistent lifecycle handling.
//!
//! Every long-running task is tracked and cancellable; a task that fails
//! unexpectedly cancels the application token so the process shuts down
//! instead of limping along without its dispatch loop or HTTP server.

use std::future::Future;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

pub fn spawn_cancellable_task<F, Fut>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_builder: F,
) where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let task_token = app_token.clone();

    tracker.spawn(async move {
        match task_builder(task_token.clone()).await {
            Ok(()) => {
                info!("Background task completed");
            }
            Err(e) => {
                error!(error = ?e, "Background task failed unexpectedly");
                task_token.cancel();
            }
        }
    });
}
