//! Error types for the real-time core and their HTTP/WebSocket renderings.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kinship_shared::{ProblemDetails, ServerEvent};
use thiserror::Error;

/// Failure inside a store collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Backend(String),
    #[error("corrupt record in `{collection}`: {detail}")]
    Corrupt { collection: String, detail: String },
}

/// Reasons a connection attempt is refused. All of them are fatal to the
/// attempt: nothing is registered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("authentication token required")]
    MissingCredential,
    #[error("invalid authentication token")]
    InvalidCredential,
    #[error("user not found")]
    IdentityNotFound,
    #[error("user is inactive")]
    IdentityInactive,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HandshakeError {
    pub fn code(&self) -> &'static str {
        match self {
            HandshakeError::MissingCredential => "MISSING_CREDENTIAL",
            HandshakeError::InvalidCredential => "INVALID_CREDENTIAL",
            HandshakeError::IdentityNotFound => "IDENTITY_NOT_FOUND",
            HandshakeError::IdentityInactive => "IDENTITY_INACTIVE",
            HandshakeError::Store(_) => "STORE_ERROR",
        }
    }
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        let problem = match &self {
            HandshakeError::Store(e) => ProblemDetails::internal_error(e.to_string()),
            other => ProblemDetails::unauthorized(other.to_string()),
        }
        .with_code(self.code());
        problem_response(problem)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDirection {
    /// The recipient has blocked the sender.
    BlockedByRecipient,
    /// The sender has blocked the recipient.
    BlockedBySender,
}

impl std::fmt::Display for BlockDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockDirection::BlockedByRecipient => write!(f, "you are blocked by this user"),
            BlockDirection::BlockedBySender => write!(f, "you have blocked this user"),
        }
    }
}

/// Domain failures surfaced to the caller of a delivery operation. None of
/// them leave partial state behind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("{0}")]
    Blocked(BlockDirection),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DeliveryError {
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::Blocked(_) => "BLOCKED",
            DeliveryError::NotFound(_) => "NOT_FOUND",
            DeliveryError::InvalidRequest(_) => "INVALID_REQUEST",
            DeliveryError::Store(_) => "STORE_ERROR",
        }
    }

    /// Render as the `error` event sent back to the originating connection.
    pub fn to_event(&self, correlation_id: Option<String>) -> ServerEvent {
        ServerEvent::Error {
            code: self.code().to_string(),
            message: self.to_string(),
            correlation_id,
        }
    }
}

impl IntoResponse for DeliveryError {
    fn into_response(self) -> Response {
        let problem = match &self {
            DeliveryError::Blocked(_) => ProblemDetails::forbidden(self.to_string()),
            DeliveryError::NotFound(_) => ProblemDetails::not_found(self.to_string()),
            DeliveryError::InvalidRequest(_) => ProblemDetails::bad_request(self.to_string()),
            DeliveryError::Store(e) => ProblemDetails::internal_error(e.to_string()),
        }
        .with_code(self.code());
        problem_response(problem)
    }
}

pub(crate) fn problem_response(problem: ProblemDetails) -> Response {
    let status = StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(problem)).into_response()
}
