use crate::services::metabase_service::MetabaseError;
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

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
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

impl From<MetabaseError> for AppError {
    fn from(err: MetabaseError) -> Self {
        let status = match &err {
            MetabaseError::InvalidRequest(_) | MetabaseError::SegmentOrder(_, _) => {
                StatusCode::BAD_REQUEST
            }
            // The client and the store disagree about which segments exist.
            MetabaseError::SegmentsMismatch(_) => StatusCode::CONFLICT,
            // Expected outcome under concurrent commits or double-submission.
            MetabaseError::ObjectNotFound => StatusCode::NOT_FOUND,
            MetabaseError::ObjectAlreadyExists => StatusCode::CONFLICT,
            MetabaseError::OffsetUpdateCount { .. }
            | MetabaseError::PieceListDecode(_)
            | MetabaseError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}
