//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::token::Claims;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for token, handshake and credential operations
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Secret lookup for an audience failed or returned an empty secret
    #[error("Secret unavailable: {0}")]
    SecretUnavailable(String),

    /// Token is not a well-formed signed token
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Token signature does not verify, or the token uses an unexpected algorithm
    #[error("Bad token signature")]
    BadSignature,

    /// Token signature is valid but the token is past its expiry
    ///
    /// Carries the verified claims so a caller may refresh them.
    #[error("Token expired")]
    Expired(Box<Claims>),

    /// Token audience is not in the configured allow-list
    #[error("Audience {0:?} rejected")]
    AudienceRejected(String),

    /// Cookie-borne token without a matching CSRF header
    #[error("CSRF token mismatch")]
    CsrfMismatch,

    /// Handshake callback presented an unknown or mismatched state value
    #[error("Handshake state mismatch")]
    StateMismatch,

    /// Identity provider call failed
    #[error("Upstream error (status {status:?}): {body}")]
    Upstream {
        /// HTTP status returned by the provider, if any
        status: Option<u16>,
        /// Provider error body or transport error text
        body: String,
    },

    /// Direct or verify credentials were rejected
    #[error("Credentials rejected")]
    CredentialRejected,

    /// No acceptable authentication on the request
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Verification message could not be delivered
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Temporarily unable to take the request, e.g. a full state store
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Upstream failure without an HTTP status (transport, decoding)
    pub fn upstream(body: impl Into<String>) -> Self {
        Error::Upstream {
            status: None,
            body: body.into(),
        }
    }

    /// Whether this error is one of the token verification failures
    ///
    /// These all render the same response body.
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedToken(_)
                | Error::BadSignature
                | Error::Expired(_)
                | Error::AudienceRejected(_)
                | Error::CsrfMismatch
                | Error::Unauthorized(_)
        )
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Optional error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            status: status.as_u16(),
        }
    }

    /// Create error response with a code
    pub fn with_code(
        status: StatusCode,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.is_token_error() {
            // the peer only ever learns "unauthorized"
            tracing::debug!(kind = %self, "token rejected");
            let body = ErrorResponse::with_code(
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Unauthorized",
            );
            return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
        }

        let (status, error_response) = match self {
            Error::Config(e) => {
                tracing::error!("Configuration error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "CONFIG_ERROR",
                        "Internal server error",
                    ),
                )
            }

            Error::SecretUnavailable(msg) | Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "Internal server error",
                    ),
                )
            }

            Error::StateMismatch => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_code(
                    StatusCode::FORBIDDEN,
                    "STATE_MISMATCH",
                    "Unexpected handshake state",
                ),
            ),

            Error::Upstream { status, body } => {
                tracing::error!(?status, "Identity provider error: {}", body);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::with_code(
                        StatusCode::BAD_GATEWAY,
                        "UPSTREAM_ERROR",
                        "Identity provider request failed",
                    ),
                )
            }

            Error::CredentialRejected => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_code(
                    StatusCode::FORBIDDEN,
                    "CREDENTIAL_REJECTED",
                    "Incorrect user or password",
                ),
            ),

            Error::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_code(StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            ),

            Error::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ),

            Error::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ),

            Error::Unavailable(msg) => {
                tracing::warn!("Rejecting request: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorResponse::with_code(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "UNAVAILABLE",
                        "Service temporarily unavailable",
                    ),
                )
            }

            Error::Delivery(msg) => {
                tracing::error!("Verification delivery failed: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::with_code(
                        StatusCode::BAD_GATEWAY,
                        "DELIVERY_ERROR",
                        "Failed to send confirmation",
                    ),
                )
            }

            // covered by is_token_error above
            other => {
                tracing::error!("Unexpected error: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "An unexpected error occurred",
                    ),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}
