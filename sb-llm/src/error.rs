use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model call timed out after {0}ms")]
    Timeout(u64),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl LlmError {
    /// Network failures, timeouts, rate limits and provider 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::InvalidInput(_) | Self::ResponseFormat(_) => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::LlmError;

    #[test]
    fn transient_classification_follows_status_codes() {
        assert!(LlmError::Http("connection reset".to_string()).is_transient());
        assert!(LlmError::Timeout(30_000).is_transient());
        assert!(
            LlmError::Status {
                status: 429,
                body: "slow down".to_string()
            }
            .is_transient()
        );
        assert!(
            LlmError::Status {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !LlmError::Status {
                status: 401,
                body: "bad key".to_string()
            }
            .is_transient()
        );
        assert!(!LlmError::ResponseFormat("missing choices".to_string()).is_transient());
    }
}
