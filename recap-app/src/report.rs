//! Deterministic rendering of summaries, acknowledgments and failures.
//!
//! Everything here is pure: identical inputs give byte-identical payloads.

use crate::error::JobError;
use crate::job::{AckStatus, SummaryMode};
use crate::summarizer::{SummaryResult, SummaryWindow};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayPayload {
    /// Plain mrkdwn fallback; also what notifications show.
    pub text: String,
    pub blocks: Vec<Value>,
}

impl DisplayPayload {
    fn text_only(text: String) -> Self {
        Self {
            text,
            blocks: Vec::new(),
        }
    }
}

fn clock(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}

fn window_hours(window: &SummaryWindow) -> i64 {
    (window.end - window.start).num_hours().max(1)
}

fn section(text: &str) -> Value {
    json!({ "type": "section", "text": { "type": "mrkdwn", "text": text } })
}

fn bullet_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return format!("_{empty}_");
    }
    items
        .iter()
        .map(|item| format!("• {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build(result: &SummaryResult, channel_label: &str) -> DisplayPayload {
    let (window, mode) = (&result.window, result.mode);
    if result.is_empty() {
        return build_empty(window, mode, channel_label);
    }

    let title = match mode {
        SummaryMode::Complete => format!("*:memo: Summary of {channel_label}*"),
        SummaryMode::Unread => format!("*:envelope_with_arrow: Your unread messages in {channel_label}*"),
    };
    let topics = format!("*Topics*\n{}", bullet_list(&result.topics, "No clear topics"));
    let decisions = format!(
        "*Decisions & actions*\n{}",
        bullet_list(&result.decisions, "No decisions recorded")
    );
    let contributors = if result.contributors.is_empty() {
        "*Top contributors*\n_None_".to_string()
    } else {
        let ranked = result
            .contributors
            .iter()
            .enumerate()
            .map(|(rank, c)| {
                let noun = if c.message_count == 1 { "message" } else { "messages" };
                format!("{}. {} ({} {noun})", rank + 1, c.name, c.message_count)
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!("*Top contributors*\n{ranked}")
    };
    let mut footer = format!(
        "{} message{} from {} to {}",
        result.message_count,
        if result.message_count == 1 { "" } else { "s" },
        clock(window.start),
        clock(window.end)
    );
    if result.partial {
        footer.push_str(match mode {
            SummaryMode::Unread => {
                ". Only the most recent messages fit; older unread messages were left unread"
            }
            SummaryMode::Complete => ". Only the most recent messages fit; older ones were skipped",
        });
    }

    let text = [
        title.as_str(),
        topics.as_str(),
        decisions.as_str(),
        contributors.as_str(),
        footer.as_str(),
    ]
    .join("\n\n");
    let blocks = vec![
        section(&title),
        json!({ "type": "divider" }),
        section(&topics),
        section(&decisions),
        section(&contributors),
        json!({
            "type": "context",
            "elements": [{ "type": "mrkdwn", "text": footer }]
        }),
    ];
    DisplayPayload { text, blocks }
}

/// Canned "nothing to summarize" report.
pub fn build_empty(window: &SummaryWindow, mode: SummaryMode, channel_label: &str) -> DisplayPayload {
    let text = match mode {
        SummaryMode::Unread => format!(
            ":white_check_mark: You're all caught up in {channel_label}. No new messages since {}.",
            clock(window.start)
        ),
        SummaryMode::Complete => format!(
            ":zzz: Nothing to summarize in {channel_label} for the last {} hours.",
            window_hours(window)
        ),
    };
    DisplayPayload::text_only(text)
}

pub fn build_ack(status: AckStatus, mode: SummaryMode, channel_label: &str) -> DisplayPayload {
    let what = match mode {
        SummaryMode::Complete => "a summary",
        SummaryMode::Unread => "your unread summary",
    };
    let text = match status {
        AckStatus::Started => {
            format!(":hourglass_flowing_sand: Working on {what} of {channel_label}. It will appear here shortly.")
        }
        AckStatus::Joined => {
            format!(":hourglass_flowing_sand: Already working on {what} of {channel_label}. It will appear here shortly.")
        }
        AckStatus::Duplicate => {
            format!(":information_source: That request for {channel_label} was already handled.")
        }
    };
    DisplayPayload::text_only(text)
}

/// Returned when the acknowledgment path itself runs out of time.
pub fn build_slow_ack() -> DisplayPayload {
    DisplayPayload::text_only(
        ":hourglass_flowing_sand: Still working on it. Your summary will appear here shortly."
            .to_string(),
    )
}

pub fn build_failure(error: &JobError, channel_label: &str) -> DisplayPayload {
    let headline = error.user_message(channel_label);
    let Some(digest) = error.digest() else {
        return DisplayPayload::text_only(headline);
    };
    let noun = if digest.message_count == 1 { "message" } else { "messages" };
    let mut text = format!(
        "{headline}\n{} {noun} in scope",
        digest.message_count
    );
    if !digest.contributors.is_empty() {
        text.push_str(&format!(" from {}", digest.contributors.join(", ")));
    }
    text.push_str(". Nothing was marked as read; try again later for a full summary.");
    DisplayPayload::text_only(text)
}
