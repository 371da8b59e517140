// HTTP error responses. The WebSocket path never produces these: credential
// and protocol problems there end in close frames or `error` events.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::request_id;

/// Every variant renders as
/// `{"error":{"code","message","retryable","request_id","details"}}`.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A path segment that must be a user id was not an integer.
    #[error("{field} must be an integer")]
    InvalidUserId { field: &'static str },
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("requested resource not found")]
    NotFound,
    #[error("internal server error")]
    Internal,
}

impl RelayError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidUserId { .. } => "VALIDATION_FAILED",
            Self::Unauthorized(_) => "AUTH_INVALID_TOKEN",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidUserId { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Value {
        match self {
            Self::InvalidUserId { field } => json!({ "field": field }),
            _ => json!({}),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = request_id::current();
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "retryable": matches!(self, Self::Internal),
                "request_id": request_id,
                "details": self.details(),
            }
        });

        let mut response = (self.status(), Json(body)).into_response();
        if let Some(request_id) = request_id {
            request_id::attach_header(&mut response, &request_id);
        }
        response
    }
}
