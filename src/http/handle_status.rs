use axum::{Json, extract::State};
use serde::Serialize;

use crate::http::context::WebContext;
use crate::http::errors::WebError;

#[derive(Serialize)]
pub(super) struct StatusResponse {
    mode: &'static str,
    version: String,
    batch_size: usize,
    max_per_cycle: usize,
    cycle_interval_secs: u64,
    lock_stale_secs: u64,
    marker_stale_secs: u64,
    stuck_delivering_secs: u64,
}

/// GET /status: dispatcher mode and effective tuning, for operators.
pub(super) async fn handle_status(State(context): State<WebContext>) -> Json<StatusResponse> {
    let config = &context.config;
    Json(StatusResponse {
        mode: config.mode(),
        version: config.version.clone(),
        batch_size: config.cycle.batch_size,
        max_per_cycle: config.cycle.max_per_cycle,
        cycle_interval_secs: config.cycle.interval_secs,
        lock_stale_secs: config.staleness.lock_stale_secs,
        marker_stale_secs: config.staleness.marker_stale_secs,
        stuck_delivering_secs: config.staleness.stuck_delivering_secs,
    })
}

/// GET /health: liveness plus a round-trip to the backing store.
pub(super) async fn handle_health(
    State(context): State<WebContext>,
) -> Result<Json<serde_json::Value>, WebError> {
    context
        .kv
        .health_check()
        .await
        .map_err(|err| WebError::StorageUnavailable {
            details: err.to_string(),
        })?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}
