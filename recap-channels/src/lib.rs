//! Channel collaborators for Recap.
//!
//! Adapters are pure I/O: they read channel history, resolve authors and
//! deliver finished reports. Retry and marker policy live in the app.

mod error;
mod response_url;
mod slack;
mod traits;
mod types;

pub use error::{DeliveryError, SourceError};
pub use response_url::ResponseUrlNotifier;
pub use slack::{SlackClient, looks_like_channel_id};
pub use traits::{AuthorDirectory, DeliveryNotifier, MessageSource};
pub use types::{
    CallbackTarget, ChannelId, ChannelRef, FetchWindow, Message, MessageBatch, MessageFlags,
    MessageId, OutboundReport, Position, UserId, Visibility,
};
