//! Unified error handling for the server.
//!
//! [`AppError`] covers both surfaces this server exposes: the few plain HTTP
//! routes (health check) via [`IntoResponse`], and the WebSocket anchor
//! protocol via [`AppError::status_code`] / [`AppError::as_action_error`],
//! which map onto the status codes and `{callId, error}` frames spec.md §7
//! defines.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The handshake token didn't resolve to a known user.
    #[error("unauthorized")]
    Unauthorized,

    /// The token resolved to a user who isn't allowed to follow this anchor.
    #[error("forbidden")]
    Forbidden,

    /// The anchor doesn't exist in the authoritative store.
    #[error("anchor not found: {0}")]
    AnchorNotFound(String),

    /// A recoverable failure in an external collaborator (coordination
    /// store, document cache) that the caller should retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A state the system's own invariants say can't happen. Always a bug;
    /// logged loudly and surfaced as a 500 / closed connection.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// A client-invoked RPC action failed; reported back over the same
    /// connection via `{callId, error}`, never closes the socket.
    #[error("action failed: {0}")]
    ActionError(String),

    #[error("core error: {0}")]
    Core(#[from] sync_core::Error),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl AppError {
    /// The status code sent in the connection handshake response
    /// (`{status_code}`), per spec.md §4.7 / §7.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Unauthorized => 401,
            AppError::Forbidden => 403,
            AppError::AnchorNotFound(_) => 404,
            AppError::Transient(_) | AppError::InternalInvariant(_) | AppError::Core(_) => 500,
            AppError::ActionError(_) => 400,
            AppError::BadRequest(_) => 400,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transient(_))
    }
}

/// Error response body for the plain HTTP surface.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.status_code() {
            401 => StatusCode::UNAUTHORIZED,
            403 => StatusCode::FORBIDDEN,
            404 => StatusCode::NOT_FOUND,
            400 => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match &self {
            AppError::InternalInvariant(msg) => tracing::error!(%msg, "internal invariant violated"),
            AppError::Transient(msg) => tracing::warn!(%msg, "transient failure"),
            AppError::Core(err) => tracing::warn!(%err, "core error"),
            _ => {}
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
