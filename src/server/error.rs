//! HTTP error surface.
//!
//! Every handler error is folded into [`ApiError`], which renders as a
//! JSON body with the right status code. Ownership failures always map
//! to 404 so callers cannot probe for other users' session ids.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::core::SessionError;

#[derive(Debug)]
pub enum ApiError {
    InvalidInput(String),
    Unauthorized,
    NotFound,
    RateLimited(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::InvalidInput(msg) => msg.clone(),
            ApiError::Unauthorized => "unauthorized".to_string(),
            ApiError::NotFound => "session not found".to_string(),
            ApiError::RateLimited(msg) => msg.clone(),
            ApiError::Internal(msg) => {
                // Internal detail goes to the log, not the wire.
                log::error!("internal error: {msg}");
                "internal error".to_string()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.message() }))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidUserId
            | SessionError::MissingPrimaryKey
            | SessionError::PathTraversal
            | SessionError::CommandTooLong(_)
            | SessionError::InvalidSize => ApiError::InvalidInput(err.to_string()),
            SessionError::NotFound(_) | SessionError::NotActive(_) => ApiError::NotFound,
            SessionError::SessionLimitExceeded(_) | SessionError::CommandRateLimited(_) => {
                ApiError::RateLimited(err.to_string())
            }
            SessionError::WorkspaceCreateFailed(_)
            | SessionError::PtyStartFailed(_)
            | SessionError::EncryptFailed(_)
            | SessionError::WriteFailed(_)
            | SessionError::ResizeFailed(_) => ApiError::Internal(err.to_string()),
        }
    }
}
