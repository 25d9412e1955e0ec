//! API error types and JSON error response formatting.
//!
//! Every failure leaves the server as `{ "error": code, "message": text }`
//! with a status code matched to the cause.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use colloquy_chat::ChatError;
use colloquy_core::error::ColloquyError;

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    /// 400 - missing or invalid parameters.
    BadRequest(String),
    /// 404 - unknown session, message or record.
    NotFound(String),
    /// 422 - the input was understood but cannot be used (e.g., not an image).
    UnprocessableEntity(String),
    /// 500
    Internal(String),
    /// 502 - the model or recognition service failed.
    BadGateway(String),
    /// 503 - a device or the store is not usable.
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::UnprocessableEntity(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "bad_gateway", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<ColloquyError> for ApiError {
    fn from(err: ColloquyError) -> Self {
        let message = err.to_string();
        match err {
            ColloquyError::InvalidImage(_) => ApiError::UnprocessableEntity(message),
            ColloquyError::ModelRequest(_) | ColloquyError::RecognitionService(_) => {
                ApiError::BadGateway(message)
            }
            ColloquyError::Camera(_)
            | ColloquyError::Audio(_)
            | ColloquyError::Synthesis(_)
            | ColloquyError::StorageUnavailable(_) => ApiError::ServiceUnavailable(message),
            ColloquyError::Config(_) => ApiError::BadRequest(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::EmptyMessage => ApiError::BadRequest(err.to_string()),
            ChatError::SessionNotFound(_) | ChatError::MessageNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            ChatError::Core(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(ChatError::EmptyMessage), StatusCode::BAD_REQUEST),
            (
                ApiError::from(ChatError::SessionNotFound(uuid::Uuid::nil())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(ColloquyError::InvalidImage("x".into())),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiError::from(ColloquyError::RecognitionService("x".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ApiError::from(ColloquyError::Camera("x".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(ColloquyError::Storage("x".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
