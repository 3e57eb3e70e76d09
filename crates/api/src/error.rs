//! HTTP error responses for the JSON endpoints.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nimbus_core::StorageError;
use nimbus_shared::AppError;
use serde_json::json;
use tracing::error;

/// An [`AppError`] rendered as `{ "error": code, "message": text }`.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self(app_error(&err))
    }
}

fn app_error(err: &StorageError) -> AppError {
    let message = err.to_string();
    match err {
        StorageError::NotFound { .. } | StorageError::SessionNotFound(_) => {
            AppError::NotFound(message)
        }
        StorageError::ObjectExisted { .. } => AppError::Conflict(message),
        StorageError::InvalidKey(_)
        | StorageError::ChunkOutOfRange { .. }
        | StorageError::SizeMismatch { .. }
        | StorageError::FileTooLarge { .. }
        | StorageError::Unsupported(_) => AppError::Validation(message),
        StorageError::Signature(_) => AppError::Forbidden(message),
        StorageError::Http(_) | StorageError::Remote { .. } => AppError::BadGateway(message),
        StorageError::Throttled { .. } => AppError::Unavailable(message),
        StorageError::Chunk { source, .. } => match app_error(source) {
            AppError::Storage(_) => AppError::Storage(message),
            mapped => mapped,
        },
        _ => AppError::Storage(message),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(json!({
                "error": self.0.error_code(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}
