use thiserror::Error;

/// Failures reading from the message source or author directory.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Transport failure, timeout or rate limit. Worth retrying.
    #[error("message source unavailable: {0}")]
    Unavailable(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("message source api error: {0}")]
    Api(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Api(e.to_string())
        } else {
            Self::Unavailable(e.to_string())
        }
    }
}

/// Failures posting to a callback target.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("delivery transport error: {0}")]
    Transport(String),

    #[error("delivery rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid callback target: {0}")]
    InvalidTarget(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidTarget(_) => false,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
