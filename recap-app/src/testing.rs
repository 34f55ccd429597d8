//! In-process collaborators for pipeline tests.

use crate::enrich::NormalizedMessage;
use crate::job::SummaryMode;
use crate::summarizer::{EngineError, SummaryEngine, SummaryInsights};
use async_trait::async_trait;
use recap_channels::{
    AuthorDirectory, CallbackTarget, ChannelId, ChannelRef, DeliveryError, DeliveryNotifier,
    FetchWindow, Message, MessageBatch, MessageFlags, MessageId, MessageSource, OutboundReport,
    Position, SourceError, UserId,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const CHANNEL_ID: &str = "C0123ABCD";
pub const CHANNEL_NAME: &str = "general";

pub fn position(seconds: i64) -> Position {
    Position::from_micros(seconds * 1_000_000)
}

pub fn message(seconds: i64, author: &str, text: &str) -> Message {
    let at = position(seconds);
    Message {
        id: MessageId::new(at.to_slack_ts()),
        channel_id: ChannelId::new(CHANNEL_ID),
        author_id: Some(UserId::new(author)),
        text: text.to_string(),
        position: at,
        flags: MessageFlags::default(),
    }
}

pub fn normalized(seconds: i64, author: &str, name: &str, text: &str) -> NormalizedMessage {
    let at = position(seconds);
    NormalizedMessage {
        id: MessageId::new(at.to_slack_ts()),
        author_id: UserId::new(author),
        author_name: name.to_string(),
        text: text.to_string(),
        position: at,
        thread_reply: false,
    }
}

/// One channel of history plus a name directory.
pub struct InMemorySource {
    channel: ChannelRef,
    messages: Mutex<Vec<Message>>,
    names: HashMap<UserId, String>,
    denied: Mutex<HashSet<UserId>>,
    transient_failures: AtomicUsize,
    fetch_delay: Duration,
    page_cap: Option<usize>,
    fetches: AtomicUsize,
    windows: Mutex<Vec<FetchWindow>>,
}

impl InMemorySource {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            channel: ChannelRef::new(CHANNEL_ID, CHANNEL_NAME),
            messages: Mutex::new(messages),
            names: HashMap::from([
                (UserId::new("UA"), "ana".to_string()),
                (UserId::new("UB"), "bo".to_string()),
                (UserId::new("UC"), "cy".to_string()),
            ]),
            denied: Mutex::new(HashSet::new()),
            transient_failures: AtomicUsize::new(0),
            fetch_delay: Duration::ZERO,
            page_cap: None,
            fetches: AtomicUsize::new(0),
            windows: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Return at most `cap` messages, newest first like a paginated history API.
    pub fn with_page_cap(mut self, cap: usize) -> Self {
        self.page_cap = Some(cap);
        self
    }

    /// Fail the next `count` fetches with a transient error.
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn deny(&self, user: &str) {
        if let Ok(mut denied) = self.denied.lock() {
            denied.insert(UserId::new(user));
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn last_window(&self) -> Option<FetchWindow> {
        self.windows.lock().ok().and_then(|w| w.last().copied())
    }
}

#[async_trait]
impl MessageSource for InMemorySource {
    fn source_id(&self) -> &str {
        "memory"
    }

    async fn resolve_channel(&self, reference: &str) -> Result<ChannelRef, SourceError> {
        let trimmed = reference.trim();
        let bare = match trimmed.strip_prefix("<#").and_then(|s| s.strip_suffix('>')) {
            Some(inner) => inner.split('|').next().unwrap_or(inner),
            None => trimmed.trim_start_matches('#'),
        };
        if bare.eq_ignore_ascii_case(CHANNEL_NAME) || bare == CHANNEL_ID {
            Ok(self.channel.clone())
        } else {
            Err(SourceError::ChannelNotFound(reference.to_string()))
        }
    }

    async fn check_access(&self, channel: &ChannelRef, user: &UserId) -> Result<(), SourceError> {
        let denied = self
            .denied
            .lock()
            .map(|denied| denied.contains(user))
            .unwrap_or(false);
        if denied {
            return Err(SourceError::AccessDenied(format!(
                "you are not a member of {}",
                channel.label()
            )));
        }
        Ok(())
    }

    async fn fetch_messages(
        &self,
        _channel: &ChannelRef,
        window: &FetchWindow,
    ) -> Result<MessageBatch, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut windows) = self.windows.lock() {
            windows.push(*window);
        }
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::Unavailable("history timed out".to_string()));
        }
        let mut messages: Vec<Message> = self
            .messages
            .lock()
            .map(|messages| {
                messages
                    .iter()
                    .filter(|message| window.contains(message.position))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        messages.sort_by_key(|message| message.position);
        let truncated = match self.page_cap {
            Some(cap) if messages.len() > cap => {
                messages.drain(..messages.len() - cap);
                true
            }
            _ => false,
        };
        Ok(MessageBatch {
            messages,
            truncated,
        })
    }
}

#[async_trait]
impl AuthorDirectory for InMemorySource {
    async fn display_name(&self, user: &UserId) -> Result<String, SourceError> {
        self.names
            .get(user)
            .cloned()
            .ok_or_else(|| SourceError::Api(format!("unknown user {user}")))
    }
}

/// Engine that plays back queued outcomes, then a default.
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Result<SummaryInsights, EngineError>>>,
    fallback: Result<SummaryInsights, EngineError>,
    delay: Duration,
    calls: AtomicUsize,
    inputs: Mutex<Vec<usize>>,
}

impl ScriptedEngine {
    pub fn succeeding() -> Self {
        Self::with_fallback(Ok(SummaryInsights {
            topics: vec!["Release planning".to_string()],
            decisions: vec!["Ship on Friday".to_string()],
        }))
    }

    pub fn always(error: EngineError) -> Self {
        Self::with_fallback(Err(error))
    }

    fn with_fallback(fallback: Result<SummaryInsights, EngineError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn then_fail(self, error: EngineError) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Message counts of every call, in order.
    pub fn inputs(&self) -> Vec<usize> {
        self.inputs.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SummaryEngine for ScriptedEngine {
    async fn summarize(
        &self,
        messages: &[NormalizedMessage],
        _mode: SummaryMode,
    ) -> Result<SummaryInsights, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(messages.len());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    posts: Mutex<Vec<(CallbackTarget, OutboundReport)>>,
    settle: Duration,
}

impl RecordingNotifier {
    /// Record each post, then take `settle` before reporting success.
    pub fn slow(settle: Duration) -> Self {
        Self {
            posts: Mutex::new(Vec::new()),
            settle,
        }
    }

    pub fn posts(&self) -> Vec<(CallbackTarget, OutboundReport)> {
        self.posts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn last_text(&self) -> Option<String> {
        self.posts().last().map(|(_, report)| report.text.clone())
    }
}

#[async_trait]
impl DeliveryNotifier for RecordingNotifier {
    async fn post(
        &self,
        callback: &CallbackTarget,
        report: &OutboundReport,
    ) -> Result<(), DeliveryError> {
        if let Ok(mut posts) = self.posts.lock() {
            posts.push((callback.clone(), report.clone()));
        }
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        Ok(())
    }
}

/// Notifier whose callback target always answers 500.
#[derive(Default)]
pub struct FailingNotifier {
    calls: AtomicUsize,
}

impl FailingNotifier {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryNotifier for FailingNotifier {
    async fn post(
        &self,
        _callback: &CallbackTarget,
        _report: &OutboundReport,
    ) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(DeliveryError::Rejected {
            status: 500,
            body: "internal_error".to_string(),
        })
    }
}
