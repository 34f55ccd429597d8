//! Slash-command grammar for `/summary` and `/unread`.

use crate::job::SummaryMode;
use recap_channels::Visibility;
use thiserror::Error;

pub const USAGE: &str = "*Recap usage*\n\
• `/summary [#channel] [private|public]`: summarize the last day of a channel\n\
• `/summary unread [#channel] [private|public]`: summarize only what you haven't read\n\
• `/unread [#channel] [private|public]`: same as `/summary unread`\n\
The channel defaults to the one you're in. Full summaries are posted to the channel, unread summaries only to you.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Summarize {
        mode: SummaryMode,
        /// Raw reference; `None` means the channel the command was typed in.
        channel: Option<String>,
        visibility: Visibility,
    },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command {0}")]
    UnknownCommand(String),

    #[error("unexpected argument {0:?}")]
    UnexpectedArgument(String),
}

pub fn parse(command: &str, text: &str) -> Result<Invocation, CommandError> {
    let mut mode = match command.trim().to_ascii_lowercase().as_str() {
        "/summary" | "/recap" => SummaryMode::Complete,
        "/unread" => SummaryMode::Unread,
        other => return Err(CommandError::UnknownCommand(other.to_string())),
    };

    let mut channel = None;
    let mut visibility = None;
    for token in text.split_whitespace() {
        match token.to_ascii_lowercase().as_str() {
            "help" | "-h" | "--help" => return Ok(Invocation::Help),
            "unread" if mode == SummaryMode::Complete && channel.is_none() => {
                mode = SummaryMode::Unread;
            }
            "private" | "ephemeral" => visibility = Some(Visibility::Private),
            "public" | "in_channel" => visibility = Some(Visibility::Broadcast),
            _ if channel.is_none() => channel = Some(token.to_string()),
            _ => return Err(CommandError::UnexpectedArgument(token.to_string())),
        }
    }

    Ok(Invocation::Summarize {
        mode,
        channel,
        visibility: visibility.unwrap_or_else(|| mode.default_visibility()),
    })
}

/// Usage text, prefixed with what went wrong when parsing failed.
pub fn usage_for(error: Option<&CommandError>) -> String {
    match error {
        Some(error) => format!(":warning: Sorry, {error}.\n\n{USAGE}"),
        None => USAGE.to_string(),
    }
}
