use crate::services::{
    image_service::IngestError, object_store::StoreError, poem_service::PoemError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error. The detailed message is
    /// only exposed outside production mode.
    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "internal error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, gated_detail(msg))
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 403 Forbidden
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }
}

/// Replace upstream detail with a generic message when running in production.
fn gated_detail(msg: String) -> String {
    if std::env::var("APP_ENV").is_ok_and(|v| v == "production") {
        "internal server error".to_string()
    } else {
        msg
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<PoemError> for AppError {
    fn from(err: PoemError) -> Self {
        match err {
            PoemError::NotFound(_) => AppError::not_found(err.to_string()),
            PoemError::Forbidden => AppError::forbidden(err.to_string()),
            PoemError::Sqlx(e) => AppError::internal(e.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match &err {
            // Each classified upload failure keeps its own user-facing message.
            StoreError::PermissionDenied
            | StoreError::BucketMissing
            | StoreError::CredentialInvalid
            | StoreError::SignatureMismatch => {
                AppError::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            StoreError::Transient(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            StoreError::Http(_) | StoreError::Malformed(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::EmptyPayload | IngestError::InvalidBase64(_) => {
                AppError::bad_request(err.to_string())
            }
            IngestError::RemoteFetch(_) => AppError::new(StatusCode::BAD_GATEWAY, err.to_string()),
            IngestError::Store(store) => store.into(),
        }
    }
}
