//! Summarization engine seam and the retrying adapter around it.

use crate::enrich::NormalizedMessage;
use crate::error::{FallbackDigest, JobError};
use crate::job::SummaryMode;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use recap_channels::{Position, UserId};
use recap_llm::{ChatMessage, LlmClient, LlmError};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const MAX_ITEMS_PER_SECTION: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryInsights {
    pub topics: Vec<String>,
    pub decisions: Vec<String>,
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("summarization engine timed out")]
    Timeout,

    #[error("summarization engine transient failure: {0}")]
    Transient(String),

    #[error("summarization engine rejected the request: {0}")]
    Rejected(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

impl From<LlmError> for EngineError {
    fn from(error: LlmError) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_transient() {
            Self::Transient(error.to_string())
        } else {
            Self::Rejected(error.to_string())
        }
    }
}

#[async_trait]
pub trait SummaryEngine: Send + Sync {
    async fn summarize(
        &self,
        messages: &[NormalizedMessage],
        mode: SummaryMode,
    ) -> Result<SummaryInsights, EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contributor {
    pub name: String,
    pub message_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryResult {
    pub topics: Vec<String>,
    pub decisions: Vec<String>,
    pub contributors: Vec<Contributor>,
    pub message_count: usize,
    pub window: SummaryWindow,
    pub mode: SummaryMode,
    /// Highest position among the summarized messages; the unread marker target.
    pub latest_position: Option<Position>,
    /// The source stopped short of the window start, so only the newest messages are covered.
    pub partial: bool,
}

impl SummaryResult {
    pub fn is_empty(&self) -> bool {
        self.message_count == 0
    }
}

/// Retrying, time-bounded front of a [`SummaryEngine`].
pub struct Summarizer {
    engine: Arc<dyn SummaryEngine>,
    attempt_timeout: Duration,
    retry: RetryPolicy,
    max_contributors: usize,
}

impl Summarizer {
    pub fn new(
        engine: Arc<dyn SummaryEngine>,
        attempt_timeout: Duration,
        retry: RetryPolicy,
        max_contributors: usize,
    ) -> Self {
        Self {
            engine,
            attempt_timeout,
            retry,
            max_contributors: max_contributors.max(1),
        }
    }

    /// Empty input never reaches the engine.
    #[tracing::instrument(level = "info", skip_all, fields(messages = messages.len(), mode = %mode))]
    pub async fn summarize(
        &self,
        messages: &[NormalizedMessage],
        mode: SummaryMode,
        window: SummaryWindow,
    ) -> Result<SummaryResult, JobError> {
        let contributors = rank_contributors(messages, self.max_contributors);
        let latest_position = messages.iter().map(|message| message.position).max();
        if messages.is_empty() {
            return Ok(SummaryResult {
                topics: Vec::new(),
                decisions: Vec::new(),
                contributors,
                message_count: 0,
                window,
                mode,
                latest_position,
                partial: false,
            });
        }

        let engine = &self.engine;
        let attempt_timeout = self.attempt_timeout;
        let outcome = self
            .retry
            .run(
                "summarize",
                move |_attempt| {
                    async move {
                        match tokio::time::timeout(attempt_timeout, engine.summarize(messages, mode))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(EngineError::Timeout),
                        }
                    }
                    .boxed()
                },
                EngineError::is_transient,
            )
            .await;

        match outcome {
            Ok(insights) => Ok(SummaryResult {
                topics: insights.topics,
                decisions: insights.decisions,
                contributors,
                message_count: messages.len(),
                window,
                mode,
                latest_position,
                partial: false,
            }),
            Err(attempted) => {
                let digest = FallbackDigest {
                    message_count: messages.len(),
                    contributors: contributors.into_iter().map(|c| c.name).collect(),
                };
                tracing::warn!(
                    error = %attempted.error,
                    attempts = attempted.attempts,
                    "summarization gave up"
                );
                Err(match attempted.error {
                    EngineError::Rejected(reason) => JobError::SummarizerRejected { reason, digest },
                    EngineError::Timeout | EngineError::Transient(_) => JobError::SummarizerTimeout {
                        attempts: attempted.attempts,
                        digest,
                    },
                })
            }
        }
    }
}

/// Most active authors first, ties broken by name.
pub fn rank_contributors(messages: &[NormalizedMessage], limit: usize) -> Vec<Contributor> {
    let mut counts: HashMap<&UserId, Contributor> = HashMap::new();
    for message in messages {
        counts
            .entry(&message.author_id)
            .or_insert_with(|| Contributor {
                name: message.author_name.clone(),
                message_count: 0,
            })
            .message_count += 1;
    }
    let mut ranked: Vec<Contributor> = counts.into_values().collect();
    ranked.sort_by(|left, right| {
        right
            .message_count
            .cmp(&left.message_count)
            .then_with(|| left.name.cmp(&right.name))
    });
    ranked.truncate(limit);
    ranked
}

/// Language-model engine: asks for `{"topics": [...], "decisions": [...]}`.
pub struct LlmSummaryEngine {
    client: LlmClient,
    max_transcript_chars: usize,
}

impl LlmSummaryEngine {
    pub fn new(client: LlmClient, max_transcript_chars: usize) -> Self {
        Self {
            client: client
                .with_json_output(true)
                .with_temperature(SUMMARY_TEMPERATURE)
                .with_max_tokens(SUMMARY_MAX_TOKENS),
            max_transcript_chars,
        }
    }
}

const SUMMARY_TEMPERATURE: f32 = 0.2;
const SUMMARY_MAX_TOKENS: u32 = 1024;

const SYSTEM_PROMPT: &str = "You summarize Slack channel conversations for busy teammates. \
Reply with a single JSON object and nothing else, shaped as \
{\"topics\": [string], \"decisions\": [string]}. \
`topics` lists the main subjects discussed as short phrases. \
`decisions` lists decisions made and action items, naming the owner when the conversation does. \
Use at most 5 entries per list and leave a list empty rather than inventing content.";

#[async_trait]
impl SummaryEngine for LlmSummaryEngine {
    async fn summarize(
        &self,
        messages: &[NormalizedMessage],
        mode: SummaryMode,
    ) -> Result<SummaryInsights, EngineError> {
        let intro = match mode {
            SummaryMode::Complete => "Summarize this channel conversation.",
            SummaryMode::Unread => "Summarize these messages the reader has not seen yet.",
        };
        let transcript = build_transcript(messages, self.max_transcript_chars);
        let response = self
            .client
            .chat(&[
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(format!("{intro}\n\n{transcript}")),
            ])
            .await?;
        parse_insights(&response.content)
    }
}

/// `[HH:MM] @name: text` lines, dropping the oldest lines past `max_chars`.
pub fn build_transcript(messages: &[NormalizedMessage], max_chars: usize) -> String {
    let lines: Vec<String> = messages
        .iter()
        .map(|message| {
            let clock = message
                .position
                .to_datetime()
                .map(|at| at.format("%H:%M").to_string())
                .unwrap_or_else(|| "--:--".to_string());
            let thread = if message.thread_reply { " (in thread)" } else { "" };
            format!(
                "[{clock}] @{}{thread}: {}",
                message.author_name,
                message.text.replace('\n', " ")
            )
        })
        .collect();

    let mut kept = 0;
    let mut used = 0;
    for line in lines.iter().rev() {
        let cost = line.chars().count() + 1;
        if used + cost > max_chars {
            break;
        }
        used += cost;
        kept += 1;
    }
    let skipped = lines.len() - kept;
    let mut transcript = String::with_capacity(used + 48);
    if skipped > 0 {
        transcript.push_str(&format!("({skipped} earlier messages omitted)\n"));
    }
    transcript.push_str(&lines[skipped..].join("\n"));
    transcript
}

#[derive(Debug, Deserialize)]
struct RawInsights {
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default, alias = "actions")]
    decisions: Vec<String>,
}

/// Extract the insights object, tolerating code fences and surrounding prose.
pub fn parse_insights(content: &str) -> Result<SummaryInsights, EngineError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => {
            return Err(EngineError::Rejected(
                "model reply contained no JSON object".to_string(),
            ));
        }
    };
    let raw: RawInsights = serde_json::from_str(json)
        .map_err(|e| EngineError::Rejected(format!("model reply was not valid insights JSON: {e}")))?;
    Ok(SummaryInsights {
        topics: clean_items(raw.topics),
        decisions: clean_items(raw.decisions),
    })
}

fn clean_items(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().trim_start_matches(['-', '*', '•']).trim().to_string())
        .filter(|item| !item.is_empty())
        .take(MAX_ITEMS_PER_SECTION)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedEngine, normalized};

    fn window() -> SummaryWindow {
        let end = DateTime::from_timestamp(1_716_600_000, 0).expect("valid timestamp");
        SummaryWindow {
            start: end - chrono::Duration::hours(24),
            end,
        }
    }

    fn summarizer(engine: Arc<ScriptedEngine>) -> Summarizer {
        Summarizer::new(
            engine,
            Duration::from_millis(200),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
            5,
        )
    }

    #[test]
    fn contributors_rank_by_count_then_name() {
        let messages = vec![
            normalized(1, "U2", "bo", "a"),
            normalized(2, "U1", "ana", "b"),
            normalized(3, "U3", "cy", "c"),
            normalized(4, "U3", "cy", "d"),
            normalized(5, "U2", "bo", "e"),
        ];
        let ranked = rank_contributors(&messages, 2);
        assert_eq!(
            ranked,
            vec![
                Contributor {
                    name: "bo".to_string(),
                    message_count: 2
                },
                Contributor {
                    name: "cy".to_string(),
                    message_count: 2
                },
            ]
        );
    }

    #[test]
    fn insights_parse_through_fences_and_prose() {
        let reply = "Here you go:\n```json\n{\"topics\": [\" - launch date \", \"\"], \"actions\": [\"ana ships v2\"]}\n```";
        let insights = parse_insights(reply).expect("fenced json should parse");
        assert_eq!(insights.topics, vec!["launch date"]);
        assert_eq!(insights.decisions, vec!["ana ships v2"]);

        let err = parse_insights("I cannot help with that").expect_err("prose is rejected");
        assert!(!err.is_transient());
        assert!(matches!(parse_insights("{not json}"), Err(EngineError::Rejected(_))));
    }

    #[test]
    fn transcript_drops_oldest_lines_first() {
        let messages = vec![
            normalized(0, "U1", "ana", "first message"),
            normalized(60, "U2", "bo", "second message"),
            normalized(120, "U1", "ana", "third message"),
        ];
        let full = build_transcript(&messages, 10_000);
        assert_eq!(
            full,
            "[00:00] @ana: first message\n[00:01] @bo: second message\n[00:02] @ana: third message"
        );
        let trimmed = build_transcript(&messages, 60);
        assert!(trimmed.starts_with("(1 earlier messages omitted)\n"));
        assert!(trimmed.ends_with("[00:02] @ana: third message"));
        assert!(!trimmed.contains("first message"));
    }

    #[tokio::test]
    async fn empty_input_short_circuits() {
        let engine = Arc::new(ScriptedEngine::succeeding());
        let result = summarizer(engine.clone())
            .summarize(&[], SummaryMode::Unread, window())
            .await
            .expect("empty input succeeds");
        assert!(result.is_empty());
        assert!(result.latest_position.is_none());
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn transient_failures_retry_within_bound() {
        let engine = Arc::new(
            ScriptedEngine::succeeding()
                .then_fail(EngineError::Transient("429".into()))
                .then_fail(EngineError::Timeout),
        );
        let messages = vec![normalized(1, "U1", "ana", "hi"), normalized(2, "U2", "bo", "yo")];
        let result = summarizer(engine.clone())
            .summarize(&messages, SummaryMode::Complete, window())
            .await
            .expect("third attempt succeeds");
        assert_eq!(engine.calls(), 3);
        assert_eq!(result.message_count, 2);
        assert_eq!(result.latest_position, Some(messages[1].position));
        assert!(!result.topics.is_empty());
    }

    #[tokio::test]
    async fn slow_engine_times_out_per_attempt() {
        let engine = Arc::new(ScriptedEngine::succeeding().with_delay(Duration::from_secs(30)));
        let messages = vec![normalized(1, "U1", "ana", "hi")];
        let err = summarizer(engine.clone())
            .summarize(&messages, SummaryMode::Unread, window())
            .await
            .expect_err("slow engine should exhaust retries");
        match err {
            JobError::SummarizerTimeout { attempts, digest } => {
                assert_eq!(attempts, 3);
                assert_eq!(digest.message_count, 1);
                assert_eq!(digest.contributors, vec!["ana"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let engine = Arc::new(ScriptedEngine::always(EngineError::Rejected("blocked".into())));
        let messages = vec![normalized(1, "U1", "ana", "hi")];
        let err = summarizer(engine.clone())
            .summarize(&messages, SummaryMode::Unread, window())
            .await
            .expect_err("rejection surfaces");
        assert!(matches!(err, JobError::SummarizerRejected { .. }));
        assert_eq!(engine.calls(), 1);
    }
}
