use crate::error::SourceError;
use crate::traits::{AuthorDirectory, MessageSource};
use crate::types::{
    ChannelId, ChannelRef, FetchWindow, Message, MessageBatch, MessageFlags, MessageId, Position,
    UserId,
};
use anyhow::{Result, anyhow};
use dashmap::DashMap;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

const SLACK_API_BASE: &str = "https://slack.com/api";
const THREAD_BROADCAST: &str = "thread_broadcast";
const BOT_MESSAGE: &str = "bot_message";

/// Slack Web API client backing the message source and the author directory.
#[derive(Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    bot_token: String,
    page_limit: usize,
    max_pages: usize,
    page_delay: Duration,
    channel_cache_ttl: Duration,
    channels_by_name: Arc<DashMap<String, CachedChannel>>,
    display_names: Arc<DashMap<UserId, String>>,
    bot_user_id: Arc<OnceCell<UserId>>,
}

#[derive(Clone)]
struct CachedChannel {
    channel: ChannelRef,
    cached_at: Instant,
}

impl SlackClient {
    pub fn new(bot_token: &str) -> Result<Self> {
        let token = bot_token.trim();
        if token.is_empty() {
            return Err(anyhow!("slack bot token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            bot_token: token.to_string(),
            page_limit: 200,
            max_pages: 10,
            page_delay: Duration::from_millis(500),
            channel_cache_ttl: Duration::from_secs(3600),
            channels_by_name: Arc::new(DashMap::new()),
            display_names: Arc::new(DashMap::new()),
            bot_user_id: Arc::new(OnceCell::new()),
        })
    }

    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit.clamp(1, 1000);
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Pause between paginated calls to stay under Slack's tier limits.
    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    pub fn with_channel_cache_ttl(mut self, ttl: Duration) -> Self {
        self.channel_cache_ttl = ttl;
        self
    }

    fn api_url(&self, method: &str) -> Result<Url, SourceError> {
        Url::parse(&format!("{SLACK_API_BASE}/{method}"))
            .map_err(|e| SourceError::Api(format!("invalid slack url for {method}: {e}")))
    }

    async fn call_api<T: DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let url = self.api_url(method)?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.bot_token)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(SourceError::Unavailable(format!(
                "slack {method} returned {status}"
            )));
        }
        let body: serde_json::Value = response.json().await?;
        decode_envelope(method, body)
    }

    async fn pause_between_pages(&self) {
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
    }

    async fn channel_by_id(&self, id: &str) -> Result<ChannelRef, SourceError> {
        let body: ConversationsInfoResponse = self
            .call_api("conversations.info", &[("channel", id.to_string())])
            .await?;
        Ok(body.channel.into_ref())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn channel_by_name(&self, name: &str) -> Result<ChannelRef, SourceError> {
        if let Some(hit) = self.cached_channel(name) {
            return Ok(hit);
        }

        let mut cursor: Option<String> = None;
        for page in 0..self.max_pages {
            if page > 0 {
                self.pause_between_pages().await;
            }
            let mut query = vec![
                ("types", "public_channel,private_channel".to_string()),
                ("exclude_archived", "true".to_string()),
                ("limit", self.page_limit.to_string()),
            ];
            if let Some(cursor) = cursor.as_ref() {
                query.push(("cursor", cursor.clone()));
            }
            let body: ConversationsListResponse = self.call_api("conversations.list", &query).await?;

            let mut found = None;
            for channel in body.channels {
                let matches = channel.matches_name(name);
                let channel = channel.into_ref();
                self.channels_by_name.insert(
                    channel.name.to_ascii_lowercase(),
                    CachedChannel {
                        channel: channel.clone(),
                        cached_at: Instant::now(),
                    },
                );
                if matches && found.is_none() {
                    found = Some(channel);
                }
            }
            if let Some(channel) = found {
                tracing::debug!(channel_id = %channel.id, pages = page + 1, "slack channel resolved");
                return Ok(channel);
            }

            cursor = body.response_metadata.and_then(ResponseMetadata::next_cursor);
            if cursor.is_none() {
                break;
            }
        }
        Err(SourceError::ChannelNotFound(format!("#{name}")))
    }

    fn cached_channel(&self, name: &str) -> Option<ChannelRef> {
        let key = name.to_ascii_lowercase();
        let entry = self.channels_by_name.get(&key)?;
        if entry.cached_at.elapsed() <= self.channel_cache_ttl {
            return Some(entry.channel.clone());
        }
        drop(entry);
        self.channels_by_name.remove(&key);
        None
    }

    async fn bot_user_id(&self) -> Result<&UserId, SourceError> {
        self.bot_user_id
            .get_or_try_init(|| async {
                let body: AuthTestResponse = self.call_api("auth.test", &[]).await?;
                Ok::<_, SourceError>(UserId::new(body.user_id))
            })
            .await
    }

    async fn channel_members(&self, channel: &ChannelRef) -> Result<HashSet<String>, SourceError> {
        let mut members = HashSet::new();
        let mut cursor: Option<String> = None;
        for page in 0..self.max_pages {
            if page > 0 {
                self.pause_between_pages().await;
            }
            let mut query = vec![
                ("channel", channel.id.to_string()),
                ("limit", self.page_limit.to_string()),
            ];
            if let Some(cursor) = cursor.as_ref() {
                query.push(("cursor", cursor.clone()));
            }
            let body: ConversationsMembersResponse =
                self.call_api("conversations.members", &query).await?;
            members.extend(body.members);
            cursor = body.response_metadata.and_then(ResponseMetadata::next_cursor);
            if cursor.is_none() {
                break;
            }
        }
        Ok(members)
    }
}

#[async_trait::async_trait]
impl MessageSource for SlackClient {
    fn source_id(&self) -> &str {
        "slack"
    }

    async fn resolve_channel(&self, reference: &str) -> Result<ChannelRef, SourceError> {
        match parse_channel_reference(reference) {
            Some(ChannelLookup::Id { id, name: Some(name) }) => Ok(ChannelRef::new(id, name)),
            Some(ChannelLookup::Id { id, name: None }) => self.channel_by_id(&id).await,
            Some(ChannelLookup::Name(name)) => self.channel_by_name(&name).await,
            None => Err(SourceError::ChannelNotFound(reference.trim().to_string())),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(channel_id = %channel.id, user_id = %user))]
    async fn check_access(&self, channel: &ChannelRef, user: &UserId) -> Result<(), SourceError> {
        let bot = self.bot_user_id().await?.clone();
        let members = self.channel_members(channel).await?;
        if !members.contains(bot.as_str()) {
            return Err(SourceError::AccessDenied(format!(
                "Recap is not a member of {}. Invite it with `/invite @Recap`",
                channel.label()
            )));
        }
        if !members.contains(user.as_str()) {
            return Err(SourceError::AccessDenied(format!(
                "you are not a member of {}",
                channel.label()
            )));
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(channel_id = %channel.id))]
    async fn fetch_messages(
        &self,
        channel: &ChannelRef,
        window: &FetchWindow,
    ) -> Result<MessageBatch, SourceError> {
        let mut seen = HashSet::new();
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        let mut truncated = false;

        loop {
            if pages > 0 {
                self.pause_between_pages().await;
            }
            // `inclusive` applies to both bounds; the exclusive lower bound is enforced below.
            let mut query = vec![
                ("channel", channel.id.to_string()),
                ("limit", self.page_limit.to_string()),
                ("inclusive", "true".to_string()),
            ];
            if let Some(oldest) = window.oldest {
                query.push(("oldest", oldest.to_slack_ts()));
            }
            if let Some(latest) = window.latest {
                query.push(("latest", latest.to_slack_ts()));
            }
            if let Some(cursor) = cursor.as_ref() {
                query.push(("cursor", cursor.clone()));
            }
            let body: ConversationsHistoryResponse =
                self.call_api("conversations.history", &query).await?;
            pages += 1;

            for raw in body.messages {
                let Some(message) = raw.into_message(&channel.id) else {
                    continue;
                };
                if window.contains(message.position) && seen.insert(message.id.clone()) {
                    messages.push(message);
                }
            }

            let next = body.response_metadata.and_then(ResponseMetadata::next_cursor);
            match page_step(body.has_more, next, pages, self.max_pages) {
                PageStep::Next(next) => cursor = Some(next),
                PageStep::Done => break,
                PageStep::Truncated => {
                    // History pages run newest first, so the cap drops the oldest messages.
                    tracing::warn!(pages, fetched = messages.len(), "slack history truncated at page cap");
                    truncated = true;
                    break;
                }
            }
        }

        messages.sort_by_key(|message| message.position);
        tracing::info!(pages, fetched = messages.len(), truncated, "slack history fetched");
        Ok(MessageBatch {
            messages,
            truncated,
        })
    }
}

#[async_trait::async_trait]
impl AuthorDirectory for SlackClient {
    async fn display_name(&self, user: &UserId) -> Result<String, SourceError> {
        if let Some(name) = self.display_names.get(user) {
            return Ok(name.clone());
        }
        let body: UsersInfoResponse = self
            .call_api("users.info", &[("user", user.to_string())])
            .await?;
        let name = body
            .user
            .preferred_name()
            .ok_or_else(|| SourceError::Api(format!("user {user} has no usable name")))?;
        self.display_names.insert(user.clone(), name.clone());
        Ok(name)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PageStep {
    Next(String),
    Done,
    /// More history exists but the page cap was reached.
    Truncated,
}

fn page_step(has_more: bool, cursor: Option<String>, pages: usize, max_pages: usize) -> PageStep {
    match cursor {
        Some(_) if has_more && pages >= max_pages => PageStep::Truncated,
        Some(cursor) if has_more => PageStep::Next(cursor),
        _ => PageStep::Done,
    }
}

/// Slack conversation ids: `C` public, `G` private/group, `D` direct message.
pub fn looks_like_channel_id(raw: &str) -> bool {
    let raw = raw.trim();
    let mut chars = raw.chars();
    let Some(prefix) = chars.next() else {
        return false;
    };
    matches!(prefix, 'C' | 'G' | 'D')
        && raw.len() >= 9
        && raw.chars().any(|c| c.is_ascii_digit())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelLookup {
    Id { id: String, name: Option<String> },
    Name(String),
}

/// Accepts `general`, `#general`, `C0123ABCD` and Slack's escaped `<#C0123ABCD|general>`.
fn parse_channel_reference(raw: &str) -> Option<ChannelLookup> {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix("<#").and_then(|s| s.strip_suffix('>')) {
        let (id, name) = match inner.split_once('|') {
            Some((id, name)) => (id.trim(), Some(name.trim())),
            None => (inner.trim(), None),
        };
        if id.is_empty() {
            return None;
        }
        return Some(ChannelLookup::Id {
            id: id.to_string(),
            name: name.filter(|n| !n.is_empty()).map(ToOwned::to_owned),
        });
    }

    let bare = raw.trim_start_matches('#').trim();
    if bare.is_empty() {
        return None;
    }
    if looks_like_channel_id(bare) {
        return Some(ChannelLookup::Id {
            id: bare.to_string(),
            name: None,
        });
    }
    Some(ChannelLookup::Name(bare.to_ascii_lowercase()))
}

fn decode_envelope<T: DeserializeOwned>(
    method: &str,
    body: serde_json::Value,
) -> Result<T, SourceError> {
    let ok = body.get("ok").and_then(serde_json::Value::as_bool).unwrap_or(false);
    if !ok {
        let code = body
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        return Err(classify_slack_error(method, code));
    }
    serde_json::from_value(body)
        .map_err(|e| SourceError::Api(format!("slack {method} response did not decode: {e}")))
}

fn classify_slack_error(method: &str, code: &str) -> SourceError {
    let detail = format!("slack {method}: {code}");
    match code {
        "ratelimited" | "internal_error" | "fatal_error" | "service_unavailable"
        | "request_timeout" => SourceError::Unavailable(detail),
        "channel_not_found" => SourceError::ChannelNotFound(detail),
        "not_in_channel" | "missing_scope" | "not_authed" | "invalid_auth" | "account_inactive"
        | "token_revoked" | "access_denied" => SourceError::AccessDenied(detail),
        _ => SourceError::Api(detail),
    }
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

impl ResponseMetadata {
    fn next_cursor(self) -> Option<String> {
        self.next_cursor.filter(|cursor| !cursor.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct SlackChannel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    name_normalized: Option<String>,
}

impl SlackChannel {
    fn matches_name(&self, wanted: &str) -> bool {
        [self.name.as_deref(), self.name_normalized.as_deref()]
            .into_iter()
            .flatten()
            .any(|name| name.eq_ignore_ascii_case(wanted))
    }

    fn into_ref(self) -> ChannelRef {
        ChannelRef::new(self.id, self.name.unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct ConversationsInfoResponse {
    channel: SlackChannel,
}

#[derive(Debug, Deserialize)]
struct ConversationsListResponse {
    #[serde(default)]
    channels: Vec<SlackChannel>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ConversationsMembersResponse {
    #[serde(default)]
    members: Vec<String>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ConversationsHistoryResponse {
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct AuthTestResponse {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct UsersInfoResponse {
    user: SlackUser,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackUser {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    profile: Option<SlackProfile>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackProfile {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
}

impl SlackUser {
    fn preferred_name(&self) -> Option<String> {
        let profile = self.profile.as_ref();
        [
            profile.and_then(|p| p.display_name.as_deref()),
            profile.and_then(|p| p.real_name.as_deref()),
            self.real_name.as_deref(),
            self.name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map(ToOwned::to_owned)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SlackMessage {
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
}

impl SlackMessage {
    fn flags(&self) -> MessageFlags {
        let subtype = self.subtype.as_deref();
        MessageFlags {
            system: subtype.is_some_and(|s| s != THREAD_BROADCAST && s != BOT_MESSAGE),
            bot: self.bot_id.is_some() || subtype == Some(BOT_MESSAGE),
            thread_reply: match (self.thread_ts.as_deref(), self.ts.as_deref()) {
                (Some(thread), Some(ts)) => thread != ts,
                _ => false,
            },
        }
    }

    fn into_message(self, channel_id: &ChannelId) -> Option<Message> {
        let ts = self.ts.as_deref()?;
        let position = Position::parse(ts)?;
        let flags = self.flags();
        Some(Message {
            id: MessageId::new(ts),
            channel_id: channel_id.clone(),
            author_id: self
                .user
                .filter(|user| !user.trim().is_empty())
                .map(UserId::new),
            text: self.text.unwrap_or_default(),
            position,
            flags,
        })
    }
}
