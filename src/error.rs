use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::services::jobs::JobServiceError;
use crate::services::storage::StorageError;

/// Application-level error type for HTTP handlers.
///
/// Renders as `{"error": <message>, "code": <CODE>}`. Internal failures are
/// logged in full and reported to the client with a sanitized message.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Jobs(#[from] JobServiceError),

    #[error(transparent)]
    Upload(#[from] StorageError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Jobs(JobServiceError::Validation(msg)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Jobs(JobServiceError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", "Job not found".to_string())
            }
            AppError::Jobs(err) => internal(err),

            AppError::Upload(StorageError::UnsupportedFormat) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED_MEDIA_TYPE",
                self.to_string(),
            ),
            AppError::Upload(StorageError::Empty | StorageError::InvalidRef(_)) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", self.to_string())
            }
            AppError::Upload(err) => internal(err),

            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn internal(err: &dyn std::error::Error) -> (StatusCode, &'static str, String) {
    tracing::error!(error = %err, "Internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
