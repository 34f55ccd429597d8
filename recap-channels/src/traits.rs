use crate::error::{DeliveryError, SourceError};
use crate::types::{CallbackTarget, ChannelRef, FetchWindow, MessageBatch, OutboundReport, UserId};
use async_trait::async_trait;

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Short identifier used in logs: "slack".
    fn source_id(&self) -> &str;

    /// Resolve a user-supplied channel reference (name, `#name` or id).
    async fn resolve_channel(&self, reference: &str) -> Result<ChannelRef, SourceError>;

    /// Fail with `AccessDenied` unless both the service and `user` can read the channel.
    async fn check_access(&self, channel: &ChannelRef, user: &UserId) -> Result<(), SourceError>;

    /// Messages strictly after `window.oldest`, oldest first, deduplicated by id.
    /// A source that gives up early keeps the newest messages and sets `truncated`.
    async fn fetch_messages(
        &self,
        channel: &ChannelRef,
        window: &FetchWindow,
    ) -> Result<MessageBatch, SourceError>;
}

#[async_trait]
pub trait AuthorDirectory: Send + Sync {
    async fn display_name(&self, user: &UserId) -> Result<String, SourceError>;
}

#[async_trait]
pub trait DeliveryNotifier: Send + Sync {
    /// Post a report to a single-use callback target.
    async fn post(
        &self,
        callback: &CallbackTarget,
        report: &OutboundReport,
    ) -> Result<(), DeliveryError>;
}
