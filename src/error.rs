use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error kinds surfaced across the store, cache, and HTTP layers.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("store error: {0}")]
    StoreIo(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("store schema version {found} is newer than this binary supports ({supported})")]
    FatalSchemaMismatch { found: i32, supported: i32 },

    /// The reader's request future was dropped (client disconnected) while
    /// waiting on a backfill.
    #[error("request cancelled")]
    Cancelled,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::StoreIo(e.to_string())
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, message): (StatusCode, String) = match self {
            CoreError::UpstreamTransport(ref msg) => {
                tracing::error!(error = %msg, "upstream transport error");
                (
                    StatusCode::BAD_GATEWAY,
                    "Upstream is temporarily unavailable".into(),
                )
            }
            CoreError::StoreIo(ref msg) => {
                tracing::error!(error = %msg, "store error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Store error".into())
            }
            CoreError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            CoreError::Forbidden(_) => (
                StatusCode::FORBIDDEN,
                "This content is not available".into(),
            ),
            CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            CoreError::FatalSchemaMismatch { found, supported } => {
                tracing::error!(found, supported, "fatal schema mismatch");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Server misconfiguration".into(),
                )
            }
            CoreError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, "Cancelled".into()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let response = CoreError::NotFound("post not found".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn forbidden_maps_to_403_without_leaking_detail() {
        let response = CoreError::Forbidden("nsfw".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn validation_error_maps_to_400() {
        let response = CoreError::Validation("bad cursor".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn upstream_transport_maps_to_502() {
        let response = CoreError::UpstreamTransport("timeout".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn store_io_maps_to_500() {
        let response = CoreError::StoreIo("connection reset".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn schema_mismatch_maps_to_500() {
        let response = CoreError::FatalSchemaMismatch {
            found: 3,
            supported: 2,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
