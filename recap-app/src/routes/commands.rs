use crate::commands::{self, Invocation};
use crate::job::SummaryRequest;
use crate::report;
use crate::server::RecapState;
use axum::routing::post;
use axum::{Extension, Form, Json};
use recap_channels::{CallbackTarget, UserId};
use serde::Deserialize;
use std::sync::Arc;

/// Slack's form-encoded slash-command payload. Unused fields are ignored.
#[derive(Debug, Deserialize)]
struct SlashCommandForm {
    command: String,
    #[serde(default)]
    text: String,
    user_id: String,
    #[serde(default)]
    user_name: String,
    channel_id: String,
    #[serde(default)]
    channel_name: String,
    #[serde(default)]
    response_url: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/slack/commands", post(handle_command))
}

fn ephemeral(text: String) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "response_type": "ephemeral", "text": text }))
}

#[tracing::instrument(
    level = "info",
    skip_all,
    fields(command = %form.command, user_id = %form.user_id, user_name = %form.user_name, channel_id = %form.channel_id)
)]
async fn handle_command(
    Extension(state): Extension<Arc<RecapState>>,
    Form(form): Form<SlashCommandForm>,
) -> Json<serde_json::Value> {
    let (mode, channel, visibility) = match commands::parse(&form.command, &form.text) {
        Ok(Invocation::Summarize {
            mode,
            channel,
            visibility,
        }) => (mode, channel, visibility),
        Ok(Invocation::Help) => return ephemeral(commands::usage_for(None)),
        Err(e) => {
            tracing::info!(error = %e, text = %form.text, "slash command rejected");
            return ephemeral(commands::usage_for(Some(&e)));
        }
    };

    if form.response_url.trim().is_empty() {
        tracing::warn!("slash command arrived without response_url");
        return ephemeral(":warning: Slack did not send a response URL, so I can't reply later. Please try again.".to_string());
    }

    let channel = channel.unwrap_or_else(|| current_channel_reference(&form));
    let request = SummaryRequest {
        user_id: UserId::new(form.user_id),
        channel,
        mode,
        visibility,
        callback: CallbackTarget::new(form.response_url),
    };

    let coordinator = state.coordinator.clone();
    let submission = tokio::spawn(async move { coordinator.submit(request) });
    match tokio::time::timeout(state.ack_timeout, submission).await {
        Ok(Ok(ack)) => ephemeral(ack.payload.text),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "job submission task failed");
            ephemeral(report::build_slow_ack().text)
        }
        Err(_) => {
            tracing::warn!(
                ack_timeout_ms = state.ack_timeout.as_millis() as u64,
                "acknowledgment deadline reached before submission finished"
            );
            ephemeral(report::build_slow_ack().text)
        }
    }
}

/// The invoking channel as an escaped reference, so the label shows its name.
fn current_channel_reference(form: &SlashCommandForm) -> String {
    if form.channel_name.trim().is_empty() {
        form.channel_id.clone()
    } else {
        format!("<#{}|{}>", form.channel_id, form.channel_name)
    }
}
