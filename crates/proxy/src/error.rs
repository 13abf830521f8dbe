use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::messages::anthropic;

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Control-plane errors with appropriate HTTP status codes.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Request validation failed before reaching the policy.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication against the backend failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The backend rejected the caller's permissions.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Model or resource not found at the backend.
    #[error("{0}")]
    NotFound(String),

    /// Rate limit exceeded at the backend.
    #[error("Rate limit exceeded: {message}")]
    RateLimited { message: String },

    /// Backend API returned an error status.
    #[error("Backend API error ({status}): {message}")]
    BackendApi { status: u16, message: String },

    /// Network or connection failure reaching the backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The backend is overloaded.
    #[error("Backend overloaded: {0}")]
    Overloaded(String),

    /// A policy hook failed; the transaction is aborted.
    #[error("Policy failure: {0}")]
    PolicyFailure(String),

    /// The policy made no progress within the configured timeout.
    #[error("Policy processing timed out after {seconds}s without keepalive")]
    PolicyTimeout { seconds: f64 },

    /// The downstream consumer stalled past the bounded queue wait.
    #[error("Stream consumer stalled; dropping transaction")]
    StreamStalled,

    /// The client went away mid-stream.
    #[error("Client disconnected")]
    StreamClosed,

    /// Internal error.
    /// If Some(message), it came from the backend and can be shown.
    /// If None, it is internal and details must not leak.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl ProxyError {
    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BackendApi { status, .. } => match *status {
                400 => StatusCode::BAD_REQUEST,
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Connection(_) => StatusCode::BAD_GATEWAY,
            Self::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PolicyTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::PolicyFailure(_) | Self::StreamStalled | Self::StreamClosed | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error type string for the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::AuthenticationFailed(_) => "authentication_error",
            Self::PermissionDenied(_) => "permission_error",
            Self::NotFound(_) => "not_found_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::Overloaded(_) => "overloaded_error",
            Self::Connection(_) => "api_connection_error",
            Self::BackendApi { .. }
            | Self::PolicyFailure(_)
            | Self::PolicyTimeout { .. }
            | Self::StreamStalled
            | Self::StreamClosed
            | Self::Internal(_) => "api_error",
        }
    }

    /// Message that is safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(backend_message)) => backend_message.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            // Policy internals stay opaque; the event stream has the detail.
            Self::PolicyFailure(_) => "Policy processing failed".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Map an upstream error status and body onto the taxonomy.
pub fn map_backend_status(status: u16, message: String) -> ProxyError {
    match status {
        400 => ProxyError::InvalidRequest(message),
        401 => ProxyError::AuthenticationFailed(message),
        403 => ProxyError::PermissionDenied(message),
        404 => ProxyError::NotFound(message),
        429 => ProxyError::RateLimited { message },
        503 | 529 => ProxyError::Overloaded(message),
        _ => ProxyError::BackendApi { status, message },
    }
}

/// Error response format of the normalized dialect.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.client_message();

        let error_response = ErrorResponse {
            error: ErrorDetails {
                message,
                r#type: self.error_type().to_string(),
                code: status.as_u16(),
            },
        };

        (status, Json(error_response)).into_response()
    }
}

/// The same error rendered with an Anthropic-dialect body.
pub struct AnthropicErrorResponse {
    status: StatusCode,
    body: anthropic::ErrorResponse,
}

impl From<ProxyError> for AnthropicErrorResponse {
    fn from(error: ProxyError) -> Self {
        let status = error.status_code();
        let body = anthropic::ErrorResponse::new(anthropic::AnthropicErrorBody {
            error_type: error.error_type().to_string(),
            message: error.client_message(),
        });

        Self { status, body }
    }
}

impl IntoResponse for AnthropicErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type AnthropicResult<T> = std::result::Result<T, AnthropicErrorResponse>;
