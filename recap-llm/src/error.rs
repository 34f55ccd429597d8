use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("http transport error: {0}")]
    Transport(String),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request rejected by provider: {0}")]
    Blocked(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl LlmError {
    pub(crate) fn status(status: reqwest::StatusCode, body: &str) -> Self {
        let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        Self::Status {
            status: status.as_u16(),
            body,
        }
    }

    /// Whether a later attempt of the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::InvalidInput(_) | Self::Blocked(_) | Self::ResponseFormat(_) => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
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
    fn rate_limits_and_server_errors_are_transient() {
        for status in [408_u16, 429, 500, 503] {
            let err = LlmError::Status {
                status,
                body: String::new(),
            };
            assert!(err.is_transient(), "status {status} should be transient");
        }
        let rejected = LlmError::Status {
            status: 400,
            body: "bad request".to_string(),
        };
        assert!(!rejected.is_transient());
        assert!(!LlmError::Blocked("SAFETY".to_string()).is_transient());
        assert!(LlmError::Timeout("deadline".to_string()).is_transient());
    }

    #[test]
    fn status_error_body_is_truncated() {
        let body = "x".repeat(4096);
        let err = LlmError::status(reqwest::StatusCode::BAD_GATEWAY, &body);
        match err {
            LlmError::Status { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body.len(), 512);
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }
}
