use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BookingError>;

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend call timed out after {0}ms")]
    Timeout(u64),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl BookingError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::InvalidArguments(_)
            | Self::NotFound(_)
            | Self::Conflict(_)
            | Self::ResponseFormat(_) => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            return ErrorKind::TransientIo;
        }
        match self {
            Self::InvalidArguments(_) | Self::NotFound(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            _ => ErrorKind::Unknown,
        }
    }
}

impl From<reqwest::Error> for BookingError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for BookingError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

/// Failure taxonomy shared by command results and failed turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientIo,
    Validation,
    Conflict,
    Unknown,
}
