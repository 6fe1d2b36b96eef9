use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::http::{
    context::WebContext,
    handle_dispatch::handle_dispatch,
    handle_status::{handle_health, handle_status},
};

pub fn build_router(web_context: WebContext) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &http::Request<_>| {
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %uuid::Uuid::new_v4(),
            )
        })
        .on_response(
            |response: &http::Response<_>, latency: Duration, _span: &Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis(),
                    "finished processing request"
                );
            },
        );

    // The dispatch handler runs a full cycle inline, so the request
    // timeout must comfortably exceed one cycle's worth of batched work.
    Router::new()
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .route("/dispatch", post(handle_dispatch))
        .layer((trace_layer, TimeoutLayer::new(Duration::from_secs(120))))
        .with_state(web_context)
}
