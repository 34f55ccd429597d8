use crate::error::DeliveryError;
use crate::traits::DeliveryNotifier;
use crate::types::{CallbackTarget, OutboundReport};
use anyhow::Result;
use reqwest::Url;
use serde::Serialize;
use std::time::Duration;

/// Delivers reports to Slack's single-use `response_url` webhooks.
#[derive(Clone)]
pub struct ResponseUrlNotifier {
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ResponseUrlPayload<'a> {
    response_type: &'static str,
    text: &'a str,
    #[serde(skip_serializing_if = "<[serde_json::Value]>::is_empty")]
    blocks: &'a [serde_json::Value],
    replace_original: bool,
}

impl ResponseUrlNotifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

fn validate_target(callback: &CallbackTarget) -> Result<Url, DeliveryError> {
    let url = Url::parse(callback.as_str().trim())
        .map_err(|e| DeliveryError::InvalidTarget(format!("{e}")))?;
    match url.scheme() {
        "https" | "http" => Ok(url),
        other => Err(DeliveryError::InvalidTarget(format!(
            "unsupported scheme {other:?}"
        ))),
    }
}

fn build_payload(report: &OutboundReport) -> ResponseUrlPayload<'_> {
    ResponseUrlPayload {
        response_type: report.visibility.slack_response_type(),
        text: &report.text,
        blocks: &report.blocks,
        replace_original: report.replace_original,
    }
}

#[async_trait::async_trait]
impl DeliveryNotifier for ResponseUrlNotifier {
    #[tracing::instrument(level = "info", skip_all, fields(visibility = ?report.visibility))]
    async fn post(
        &self,
        callback: &CallbackTarget,
        report: &OutboundReport,
    ) -> Result<(), DeliveryError> {
        let url = validate_target(callback)?;
        let response = self
            .http
            .post(url)
            .json(&build_payload(report))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = body.chars().take(256).collect::<String>();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!(status = status.as_u16(), "response_url delivery accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Visibility;
    use serde_json::json;

    #[test]
    fn payload_carries_visibility_and_replace_flag() {
        let report = OutboundReport {
            text: "Summary of #general".to_string(),
            blocks: vec![json!({ "type": "divider" })],
            visibility: Visibility::Broadcast,
            replace_original: true,
        };
        let value = serde_json::to_value(build_payload(&report)).expect("payload serializes");
        assert_eq!(
            value,
            json!({
                "response_type": "in_channel",
                "text": "Summary of #general",
                "blocks": [{ "type": "divider" }],
                "replace_original": true
            })
        );
    }

    #[test]
    fn payload_omits_empty_blocks() {
        let report = OutboundReport {
            text: "working on it".to_string(),
            blocks: Vec::new(),
            visibility: Visibility::Private,
            replace_original: false,
        };
        let value = serde_json::to_value(build_payload(&report)).expect("payload serializes");
        assert_eq!(value["response_type"], "ephemeral");
        assert!(value.get("blocks").is_none());
    }

    #[test]
    fn targets_must_be_http_urls() {
        assert!(validate_target(&CallbackTarget::new("https://hooks.slack.com/commands/T1/1/abc")).is_ok());
        let err = validate_target(&CallbackTarget::new("not a url"))
            .expect_err("garbage should be rejected");
        assert!(!err.is_transient());
        assert!(matches!(
            validate_target(&CallbackTarget::new("ftp://example.com/x")),
            Err(DeliveryError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn post_fails_fast_on_invalid_target() {
        let notifier = ResponseUrlNotifier::new(Duration::from_secs(1)).expect("notifier builds");
        let report = OutboundReport {
            text: "x".to_string(),
            blocks: Vec::new(),
            visibility: Visibility::Private,
            replace_original: true,
        };
        let err = notifier
            .post(&CallbackTarget::new(""), &report)
            .await
            .expect_err("empty target should be rejected");
        assert!(matches!(err, DeliveryError::InvalidTarget(_)));
    }
}
