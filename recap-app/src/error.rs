//! Job failures and the user-facing text each failure kind renders to.

use recap_channels::SourceError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// What the user still gets when the summarizer gives up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackDigest {
    pub message_count: usize,
    pub contributors: Vec<String>,
}

/// Stable label for a terminal failure, recorded in the job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnavailable,
    AccessDenied,
    ChannelNotFound,
    StateUnavailable,
    SummarizerTimeout,
    SummarizerRejected,
    DeliveryFailed,
    DeadlineExceeded,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceUnavailable => "source_unavailable",
            Self::AccessDenied => "access_denied",
            Self::ChannelNotFound => "channel_not_found",
            Self::StateUnavailable => "state_unavailable",
            Self::SummarizerTimeout => "summarizer_timeout",
            Self::SummarizerRejected => "summarizer_rejected",
            Self::DeliveryFailed => "delivery_failed",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Stage failures of a summary job. Every variant ends the job in `Failed`
/// and none of them advance the read marker.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("message source unavailable after {attempts} attempt(s): {detail}")]
    SourceUnavailable { attempts: u32, detail: String },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("read state unavailable: {0}")]
    StateUnavailable(String),

    #[error("summarizer did not answer after {attempts} attempt(s)")]
    SummarizerTimeout {
        attempts: u32,
        digest: FallbackDigest,
    },

    #[error("summarizer rejected the request: {reason}")]
    SummarizerRejected {
        reason: String,
        digest: FallbackDigest,
    },

    #[error("delivery failed after {attempts} attempt(s): {detail}")]
    DeliveryFailed { attempts: u32, detail: String },

    #[error("job exceeded its {0:?} budget")]
    DeadlineExceeded(Duration),

    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    pub fn from_source(error: SourceError, attempts: u32) -> Self {
        match error {
            SourceError::AccessDenied(detail) => Self::AccessDenied(detail),
            SourceError::ChannelNotFound(detail) => Self::ChannelNotFound(detail),
            SourceError::Unavailable(detail) | SourceError::Api(detail) => {
                Self::SourceUnavailable { attempts, detail }
            }
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::SourceUnavailable { .. } => FailureKind::SourceUnavailable,
            Self::AccessDenied(_) => FailureKind::AccessDenied,
            Self::ChannelNotFound(_) => FailureKind::ChannelNotFound,
            Self::StateUnavailable(_) => FailureKind::StateUnavailable,
            Self::SummarizerTimeout { .. } => FailureKind::SummarizerTimeout,
            Self::SummarizerRejected { .. } => FailureKind::SummarizerRejected,
            Self::DeliveryFailed { .. } => FailureKind::DeliveryFailed,
            Self::DeadlineExceeded(_) => FailureKind::DeadlineExceeded,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Whether the failure can still be reported through the callback target.
    /// A failed delivery cannot report itself.
    pub fn deliverable(&self) -> bool {
        !matches!(self, Self::DeliveryFailed { .. })
    }

    /// Partial facts for a degraded report, when the summarizer was the failing stage.
    pub fn digest(&self) -> Option<&FallbackDigest> {
        match self {
            Self::SummarizerTimeout { digest, .. } | Self::SummarizerRejected { digest, .. } => {
                Some(digest)
            }
            _ => None,
        }
    }

    /// Deterministic user-facing text for each failure.
    pub fn user_message(&self, channel_label: &str) -> String {
        match self {
            Self::SourceUnavailable { .. } => format!(
                ":warning: Couldn't read messages from {channel_label} right now. Please try again in a minute."
            ),
            Self::AccessDenied(detail) => format!(
                ":lock: I can't summarize {channel_label}: {detail}."
            ),
            Self::ChannelNotFound(_) => format!(
                ":mag: I couldn't find {channel_label}. Check the spelling, or invite the bot if it's a private channel."
            ),
            Self::StateUnavailable(_) => format!(
                ":warning: I couldn't load your read position for {channel_label}. Nothing was marked as read; please try again."
            ),
            Self::SummarizerTimeout { .. } | Self::SummarizerRejected { .. } => format!(
                ":robot_face: AI summarization is unavailable right now for {channel_label}."
            ),
            Self::DeliveryFailed { .. } => String::new(),
            Self::DeadlineExceeded(_) | Self::Cancelled => format!(
                ":hourglass: Summarizing {channel_label} took too long and was stopped. Nothing was marked as read; please try again."
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_errors_map_to_taxonomy() {
        assert_eq!(
            JobError::from_source(SourceError::Unavailable("503".into()), 3).kind(),
            FailureKind::SourceUnavailable
        );
        assert_eq!(
            JobError::from_source(SourceError::AccessDenied("not_in_channel".into()), 1).kind(),
            FailureKind::AccessDenied
        );
        assert_eq!(
            JobError::from_source(SourceError::ChannelNotFound("#nope".into()), 1).kind(),
            FailureKind::ChannelNotFound
        );
    }

    #[test]
    fn delivery_failures_are_not_deliverable() {
        let err = JobError::DeliveryFailed {
            attempts: 3,
            detail: "500".to_string(),
        };
        assert!(!err.deliverable());
        assert!(JobError::Cancelled.deliverable());
        assert!(JobError::DeadlineExceeded(Duration::from_secs(1)).deliverable());
    }

    #[test]
    fn summarizer_failures_carry_digest() {
        let digest = FallbackDigest {
            message_count: 4,
            contributors: vec!["ana".to_string()],
        };
        let err = JobError::SummarizerRejected {
            reason: "blocked".to_string(),
            digest: digest.clone(),
        };
        assert_eq!(err.digest(), Some(&digest));
        assert!(JobError::Cancelled.digest().is_none());
        assert_eq!(err.kind().as_str(), "summarizer_rejected");
    }

    #[test]
    fn user_messages_name_the_channel() {
        let message = JobError::ChannelNotFound("x".into()).user_message("#general");
        assert!(message.contains("#general"));
        let message = JobError::Cancelled.user_message("#general");
        assert!(message.contains("Nothing was marked as read"));
    }
}
