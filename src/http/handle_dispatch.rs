use axum::{Json, extract::State};
use chrono::Utc;
use tracing::info;

use crate::dispatcher::CycleSummary;
use crate::http::context::WebContext;

/// POST /dispatch: run one dispatch cycle immediately.
///
/// Safe to call while the background loop is active; the cycle lock
/// resolves the overlap and the loser returns a zero-progress summary.
pub(super) async fn handle_dispatch(State(context): State<WebContext>) -> Json<CycleSummary> {
    info!("Dispatch cycle triggered over HTTP");
    let summary = context.dispatcher.run_cycle(Utc::now()).await;
    Json(summary)
}
