use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

#[derive(Debug, thiserror::Error)]
pub(super) enum WebError {
    #[error("storage unavailable: {details}")]
    StorageUnavailable { details: String },
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        match self {
            WebError::StorageUnavailable { details } => {
                tracing::error!(details = %details, "Health check failed");
                (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable").into_response()
            }
        }
    }
}
