//! HTTP error taxonomy for the REST surface
//!
//! Every handler failure maps onto one of these variants; the response body
//! is always `{"error": "<message>"}` with the matching status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input: unparseable body, invalid UUID, out-of-range lengths
    #[error("{0}")]
    BadRequest(String),

    /// Missing, malformed, or invalid credential
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not permitted
    #[error("{0}")]
    Forbidden(String),

    /// Entity absent or soft-deleted
    #[error("{0}")]
    NotFound(String),

    /// Duplicate unique key, already a member, DM to self
    #[error("{0}")]
    Conflict(String),

    /// Invite expired or exhausted
    #[error("{0}")]
    Gone(String),

    /// Store write failed, crypto failure, filesystem error
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ApiError::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ApiError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError::Conflict(msg.into())
    }

    pub fn gone(msg: impl Into<String>) -> Self {
        ApiError::Gone(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Gone(_) => StatusCode::GONE,
            ApiError::Internal(err) => {
                // Details stay server-side; the client gets a generic message.
                error!("internal error: {:#}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Shorthand for handler return types.
pub type ApiResult<T> = Result<T, ApiError>;
