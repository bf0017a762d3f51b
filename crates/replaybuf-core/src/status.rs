//! Status codes shared between the service layer and its collaborators.
//!
//! Tables, checkpointers and the transport all report failures as a `Status`
//! so the service can pass them through to the client unchanged.

use thiserror::Error;

/// Subset of canonical RPC status codes the service produces or propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    FailedPrecondition,
    Internal,
    Unavailable,
}

impl StatusCode {
    /// Canonical numeric value used on the wire.
    pub fn as_i32(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Cancelled => 1,
            StatusCode::InvalidArgument => 3,
            StatusCode::DeadlineExceeded => 4,
            StatusCode::NotFound => 5,
            StatusCode::FailedPrecondition => 9,
            StatusCode::Internal => 13,
            StatusCode::Unavailable => 14,
        }
    }

    pub fn from_i32(code: i32) -> Option<StatusCode> {
        match code {
            0 => Some(StatusCode::Ok),
            1 => Some(StatusCode::Cancelled),
            3 => Some(StatusCode::InvalidArgument),
            4 => Some(StatusCode::DeadlineExceeded),
            5 => Some(StatusCode::NotFound),
            9 => Some(StatusCode::FailedPrecondition),
            13 => Some(StatusCode::Internal),
            14 => Some(StatusCode::Unavailable),
            _ => None,
        }
    }
}

/// An error status with a human-readable message.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code:?}: {message}")]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Status>;
