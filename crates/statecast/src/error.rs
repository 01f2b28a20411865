use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors that can occur during relay server operation.
#[derive(Error, Debug)]
pub enum StatecastError {
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(axum::Error),
    /// A socket write did not complete in time.
    #[error("send timed out")]
    SendTimeout,
    /// The core dispatch task has stopped and no longer accepts commands.
    #[error("core dispatcher unavailable")]
    CoreUnavailable,
}

impl IntoResponse for StatecastError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "request failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Service unavailable" })),
        )
            .into_response()
    }
}

/// Why a session token failed validation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    /// No token was supplied.
    #[error("missing session token")]
    Missing,
    /// The token is unknown.
    #[error("invalid session token")]
    Invalid,
    /// The token's lifetime has elapsed.
    #[error("expired session token")]
    Expired,
    /// The token was issued to a different client IP.
    #[error("session token IP mismatch")]
    IpMismatch,
    /// The token was issued to a different origin.
    #[error("session token origin mismatch")]
    OriginMismatch,
}

impl TokenRejection {
    /// Stable reason label used in logs, metrics and response bodies.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::IpMismatch => "ip-mismatch",
            Self::OriginMismatch => "origin-mismatch",
        }
    }
}

/// Outcome of a refused channel upgrade or token request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Origin (or Host fallback) is not on the allow-list.
    #[error("Origin not allowed")]
    OriginNotAllowed,
    /// The server is at its total connection limit.
    #[error("Server at capacity")]
    CapacityGlobal,
    /// The client IP is at its connection limit.
    #[error("Too many connections from this address")]
    CapacityPerIp,
    /// The request URL could not be parsed.
    #[error("Malformed request URL")]
    BadRequest,
    /// The session token was refused.
    #[error("{0}")]
    Token(TokenRejection),
}

impl Rejection {
    /// HTTP status sent before the socket is closed.
    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::OriginNotAllowed => StatusCode::FORBIDDEN,
            Self::CapacityGlobal => StatusCode::SERVICE_UNAVAILABLE,
            Self::CapacityPerIp => StatusCode::TOO_MANY_REQUESTS,
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Token(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Stable reason label used in logs and metrics.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::OriginNotAllowed => "origin-not-allowed",
            Self::CapacityGlobal => "capacity-global",
            Self::CapacityPerIp => "capacity-per-ip",
            Self::BadRequest => "bad-request",
            Self::Token(t) => t.as_str(),
        }
    }
}

impl From<TokenRejection> for Rejection {
    fn from(value: TokenRejection) -> Self {
        Self::Token(value)
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({ "error": self.to_string(), "reason": self.reason() })),
        )
            .into_response()
    }
}
