use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::authenticator::{AuthRejection, GENERIC_DENIAL};
use crate::gateway::events::{ErrorCode, ErrorMessage};
use crate::gateway::handler::HandlerError;

/// Structured API error returned to clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Vec<FieldError>>,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn validation(details: Vec<FieldError>) -> Self {
        Self {
            details: Some(details),
            ..Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", "Validation failed")
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Everything that can go wrong between a connection attempt and a handler's
/// reply.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication rejected: {0}")]
    AuthRejected(AuthRejection),
    #[error("rate limited (burst: {burst}), retry after {retry_after}s")]
    RateLimited { retry_after: u64, burst: bool },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("message of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error(transparent)]
    Handler(HandlerError),
    #[error("message handler panicked")]
    HandlerPanicked,
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::AuthRejected(_) => ErrorCode::Unauthorized,
            GatewayError::RateLimited { burst: true, .. } => ErrorCode::BurstLimited,
            GatewayError::RateLimited { burst: false, .. } => ErrorCode::RateLimited,
            GatewayError::Malformed(_) => ErrorCode::MalformedMessage,
            GatewayError::UnknownType(_) => ErrorCode::UnknownMessageType,
            GatewayError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            GatewayError::TooLarge(_) => ErrorCode::MessageTooLarge,
            GatewayError::Handler(HandlerError::Forbidden(_)) => ErrorCode::Forbidden,
            GatewayError::Handler(HandlerError::Invalid(_)) => ErrorCode::InvalidPayload,
            GatewayError::Handler(HandlerError::NotFound(_)) => ErrorCode::NotFound,
            GatewayError::Handler(HandlerError::Internal(_)) | GatewayError::HandlerPanicked => {
                ErrorCode::HandlerFailure
            }
        }
    }

    /// Text safe to show the client. Authentication failures never say why.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::AuthRejected(_) => GENERIC_DENIAL.to_string(),
            GatewayError::RateLimited { burst: true, .. } => {
                "Too many requests in a short period".to_string()
            }
            GatewayError::RateLimited { burst: false, .. } => "Rate limit exceeded".to_string(),
            GatewayError::Malformed(_) => "Message must be a JSON object with a type".to_string(),
            GatewayError::UnknownType(kind) => format!("Unknown message type: {kind}"),
            GatewayError::InvalidPayload(detail) => format!("Invalid payload: {detail}"),
            GatewayError::TooLarge(_) => "Message too large".to_string(),
            GatewayError::Handler(HandlerError::Forbidden(m))
            | GatewayError::Handler(HandlerError::Invalid(m))
            | GatewayError::Handler(HandlerError::NotFound(m)) => m.clone(),
            GatewayError::Handler(HandlerError::Internal(_)) | GatewayError::HandlerPanicked => {
                "Failed to process message".to_string()
            }
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// The error frame sent to the client.
    pub fn to_wire(&self) -> ErrorMessage {
        ErrorMessage::new(self.code(), self.client_message()).with_retry_after(self.retry_after())
    }
}
