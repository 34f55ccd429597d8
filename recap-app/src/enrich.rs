//! Turns raw channel messages into attributed, substantive entries.

use futures_util::{FutureExt, StreamExt};
use futures_util::stream;
use recap_channels::{AuthorDirectory, Message, MessageId, Position, UserId};
use std::collections::{BTreeSet, HashMap};

const AUTHOR_LOOKUP_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMessage {
    pub id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    pub text: String,
    pub position: Position,
    pub thread_reply: bool,
}

/// Whether a raw message carries human content worth summarizing.
pub fn is_substantive(message: &Message) -> bool {
    !message.flags.system
        && !message.flags.bot
        && message.author_id.is_some()
        && !message.text.trim().is_empty()
}

/// Look up display names for every distinct author in `messages`.
///
/// A failed lookup falls back to the raw id; it never fails the stage.
#[tracing::instrument(level = "debug", skip_all, fields(messages = messages.len()))]
pub async fn resolve_authors(
    directory: &dyn AuthorDirectory,
    messages: &[Message],
) -> HashMap<UserId, String> {
    let authors: BTreeSet<&UserId> = messages
        .iter()
        .filter(|message| is_substantive(message))
        .filter_map(|message| message.author_id.as_ref())
        .collect();

    stream::iter(authors)
        .map(|author| {
            async move {
                let name = match directory.display_name(author).await {
                    Ok(name) => name,
                    Err(error) => {
                        tracing::warn!(%error, author_id = %author, "author lookup failed; using raw id");
                        author.to_string()
                    }
                };
                (author.clone(), name)
            }
            .boxed()
        })
        .boxed()
        .buffer_unordered(AUTHOR_LOOKUP_CONCURRENCY)
        .collect()
        .await
}

/// Drop non-substantive entries and attach author names. Order-preserving.
pub fn enrich(messages: &[Message], names: &HashMap<UserId, String>) -> Vec<NormalizedMessage> {
    messages
        .iter()
        .filter(|message| is_substantive(message))
        .filter_map(|message| {
            let author_id = message.author_id.clone()?;
            let author_name = names
                .get(&author_id)
                .cloned()
                .unwrap_or_else(|| author_id.to_string());
            Some(NormalizedMessage {
                id: message.id.clone(),
                author_id,
                author_name,
                text: message.text.trim().to_string(),
                position: message.position,
                thread_reply: message.flags.thread_reply,
            })
        })
        .collect()
}

/// Keep only messages strictly after `marker`.
pub fn filter_after(
    messages: Vec<NormalizedMessage>,
    marker: Option<Position>,
) -> Vec<NormalizedMessage> {
    match marker {
        Some(marker) => messages
            .into_iter()
            .filter(|message| message.position > marker)
            .collect(),
        None => messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use recap_channels::{ChannelId, MessageFlags, SourceError};

    fn message(ts: i64, author: Option<&str>, text: &str, flags: MessageFlags) -> Message {
        let position = Position::from_micros(ts * 1_000_000);
        Message {
            id: MessageId::new(position.to_slack_ts()),
            channel_id: ChannelId::new("C0123ABCD"),
            author_id: author.map(UserId::new),
            text: text.to_string(),
            position,
            flags,
        }
    }

    struct Directory;

    #[async_trait]
    impl AuthorDirectory for Directory {
        async fn display_name(&self, user: &UserId) -> Result<String, SourceError> {
            match user.as_str() {
                "U1" => Ok("ana".to_string()),
                _ => Err(SourceError::Unavailable("users.info timed out".to_string())),
            }
        }
    }

    #[test]
    fn enrich_drops_noise_and_keeps_order() {
        let raw = vec![
            message(1, Some("U1"), "first", MessageFlags::default()),
            message(
                2,
                Some("U1"),
                "joined",
                MessageFlags {
                    system: true,
                    ..MessageFlags::default()
                },
            ),
            message(
                3,
                None,
                "deploy finished",
                MessageFlags {
                    bot: true,
                    ..MessageFlags::default()
                },
            ),
            message(4, Some("U2"), "   ", MessageFlags::default()),
            message(
                5,
                Some("U2"),
                " in thread ",
                MessageFlags {
                    thread_reply: true,
                    ..MessageFlags::default()
                },
            ),
        ];
        let names = HashMap::from([(UserId::new("U1"), "ana".to_string())]);
        let normalized = enrich(&raw, &names);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].author_name, "ana");
        assert_eq!(normalized[1].author_name, "U2");
        assert_eq!(normalized[1].text, "in thread");
        assert!(normalized[1].thread_reply);
        assert!(normalized[0].position < normalized[1].position);
    }

    #[tokio::test]
    async fn failed_lookups_fall_back_to_raw_id() {
        let raw = vec![
            message(1, Some("U1"), "a", MessageFlags::default()),
            message(2, Some("U9"), "b", MessageFlags::default()),
            message(3, Some("U1"), "c", MessageFlags::default()),
        ];
        let names = resolve_authors(&Directory, &raw).await;
        assert_eq!(names.len(), 2);
        assert_eq!(names[&UserId::new("U1")], "ana");
        assert_eq!(names[&UserId::new("U9")], "U9");
    }

    #[test]
    fn filter_after_is_strict() {
        let raw = vec![
            message(10, Some("U1"), "old", MessageFlags::default()),
            message(20, Some("U1"), "at marker", MessageFlags::default()),
            message(30, Some("U1"), "new", MessageFlags::default()),
        ];
        let normalized = enrich(&raw, &HashMap::new());
        let kept = filter_after(normalized.clone(), Some(Position::from_micros(20_000_000)));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].text, "new");
        assert_eq!(filter_after(normalized, None).len(), 3);
    }
}
