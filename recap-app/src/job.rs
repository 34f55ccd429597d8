//! Summary job records and their lifecycle states.

use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use recap_channels::{CallbackTarget, UserId, Visibility, looks_like_channel_id};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryMode {
    /// Everything in the lookback window. Never touches the read marker.
    Complete,
    /// Only messages after the requester's read marker.
    Unread,
}

impl SummaryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Unread => "unread",
        }
    }

    pub fn default_visibility(self) -> Visibility {
        match self {
            Self::Complete => Visibility::Broadcast,
            Self::Unread => Visibility::Private,
        }
    }
}

impl fmt::Display for SummaryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-flight identity: one in-flight run per (user, channel, mode).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub user_id: UserId,
    /// Channel reference as submitted, normalized for comparison.
    pub channel: String,
    pub mode: SummaryMode,
}

impl JobKey {
    pub fn new(user_id: UserId, channel: &str, mode: SummaryMode) -> Self {
        Self {
            user_id,
            channel: normalize_channel_reference(channel),
            mode,
        }
    }
}

fn normalize_channel_reference(raw: &str) -> String {
    let trimmed = raw.trim();
    let bare = trimmed.strip_prefix('#').unwrap_or(trimmed).trim();
    if let Some(inner) = bare.strip_prefix("<#").and_then(|s| s.strip_suffix('>')) {
        let id = inner.split('|').next().unwrap_or(inner);
        return id.trim().to_string();
    }
    if looks_like_channel_id(bare) {
        return bare.to_string();
    }
    bare.to_ascii_lowercase()
}

/// How a submission was absorbed by the job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// A new run was started.
    Started,
    /// An equivalent run is in flight; its delivery answers this request too.
    Joined,
    /// The same callback was already answered within the retention window.
    Duplicate,
}

/// A command submission as it reaches the coordinator.
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    pub user_id: UserId,
    pub channel: String,
    pub mode: SummaryMode,
    pub visibility: Visibility,
    pub callback: CallbackTarget,
}

#[derive(Debug, Clone)]
pub struct SummaryJob {
    pub id: String,
    pub key: JobKey,
    pub epoch: u64,
    /// Raw channel reference to resolve at fetch time.
    pub channel: String,
    pub visibility: Visibility,
    pub callback: CallbackTarget,
    /// How far back the run may look.
    pub lookback: Duration,
    pub created_at: DateTime<Utc>,
}

impl SummaryJob {
    pub fn mode(&self) -> SummaryMode {
        self.key.mode
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "failure", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Fetching,
    Enriching,
    Filtering,
    Summarizing,
    Formatting,
    Delivering,
    Delivered,
    Failed(FailureKind),
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed(_))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Enriching => "enriching",
            Self::Filtering => "filtering",
            Self::Summarizing => "summarizing",
            Self::Formatting => "formatting",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Failed(_) => "failed",
        }
    }
}

/// `job_` plus the first 16 hex chars of SHA-256 over `user|channel|mode|epoch`.
pub fn derive_job_id(key: &JobKey, epoch: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.user_id.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(key.channel.as_bytes());
    hasher.update(b"|");
    hasher.update(key.mode.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(epoch.to_string().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    format!("job_{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_normalize_channel_spelling() {
        let user = UserId::new("U1");
        assert_eq!(
            JobKey::new(user.clone(), "#General", SummaryMode::Unread),
            JobKey::new(user.clone(), "general", SummaryMode::Unread)
        );
        assert_eq!(
            JobKey::new(user.clone(), "<#C0123ABCD|general>", SummaryMode::Unread).channel,
            "C0123ABCD"
        );
        assert_eq!(
            JobKey::new(user.clone(), "C0123ABCD", SummaryMode::Unread).channel,
            "C0123ABCD"
        );
        assert_ne!(
            JobKey::new(user.clone(), "general", SummaryMode::Unread),
            JobKey::new(user, "general", SummaryMode::Complete)
        );
    }

    #[test]
    fn job_ids_are_stable_and_epoch_scoped() {
        let key = JobKey::new(UserId::new("U1"), "general", SummaryMode::Unread);
        let first = derive_job_id(&key, 1);
        assert_eq!(first, derive_job_id(&key, 1));
        assert_ne!(first, derive_job_id(&key, 2));
        assert!(first.starts_with("job_"));
        assert_eq!(first.len(), "job_".len() + 16);
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Delivered.is_terminal());
        assert!(JobState::Failed(FailureKind::Cancelled).is_terminal());
        assert!(!JobState::Delivering.is_terminal());
        assert_eq!(SummaryMode::Unread.default_visibility(), Visibility::Private);
        assert_eq!(SummaryMode::Complete.default_visibility(), Visibility::Broadcast);
    }
}
