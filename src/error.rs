use serde_json::{json, Value};
use thiserror::Error;

/// HTTP-like status codes carried in every response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success = 200,
    Accepted = 202,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    Conflict = 409,
    UpgradeRequired = 426,
    TooManyRequests = 429,
    Internal = 500,
}

impl Status {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Domain-specific error sub-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidToken = 1001,
    VersionMismatch = 1002,
    SignatureInvalid = 1003,
    ParamMissing = 1004,
    RateLimited = 1005,
    UserExists = 1006,
}

impl ErrorCode {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Structured protocol error carrying status + sub-code + message.
///
/// Handlers raise these; the server loop converts them into an error
/// response on the paired ack command and keeps reading.
#[derive(Debug, Clone, Error)]
#[error("{status:?} ({code:?}): {message}")]
pub struct ProtocolError {
    pub status: Status,
    pub code: Option<ErrorCode>,
    pub message: String,
}

impl ProtocolError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(status: Status, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(Status::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Status::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Status::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Status::Conflict, message)
    }

    /// Map the error into the payload fragment consumed by clients.
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "status": self.status.as_u16(),
            "error_message": self.message,
        });
        if let Some(code) = self.code {
            payload["error_code"] = json!(code.as_u16());
        }
        payload
    }
}

impl From<sqlx::Error> for ProtocolError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        Self::new(Status::Internal, "Internal server error")
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::new(Status::Internal, format!("I/O error: {err}"))
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
