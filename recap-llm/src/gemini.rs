use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatOptions, ChatResponse, Role, Usage, split_system};
use serde::{Deserialize, Serialize};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat(&self, messages: &[ChatMessage], options: ChatOptions) -> Result<ChatResponse> {
        let req = GeminiRequest::new(messages, options)?;
        let url = format!("{GEMINI_API_BASE}/{}:generateContent", self.model);

        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::status(status, &body));
        }

        let parsed: GeminiResponse = serde_json::from_str(&body)?;
        parsed.try_into()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

impl GeminiRequest {
    fn new(messages: &[ChatMessage], options: ChatOptions) -> Result<Self> {
        let (system, turns) = split_system(messages);
        if turns.is_empty() {
            return Err(LlmError::InvalidInput(
                "gemini requires at least one user message".to_string(),
            ));
        }
        Ok(Self {
            system_instruction: (!system.is_empty()).then(|| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: system }],
            }),
            contents: turns
                .into_iter()
                .map(|m| GeminiContent {
                    role: Some(
                        match m.role {
                            Role::Assistant => "model",
                            _ => "user",
                        }
                        .to_string(),
                    ),
                    parts: vec![GeminiPart {
                        text: m.content.clone(),
                    }],
                })
                .collect(),
            generation_config: GeminiGenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_tokens,
                response_mime_type: options.json_output.then_some("application/json"),
            },
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl TryFrom<GeminiResponse> for ChatResponse {
    type Error = LlmError;

    fn try_from(v: GeminiResponse) -> Result<Self> {
        if let Some(reason) = v.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(LlmError::Blocked(reason));
        }
        let candidate = v
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ResponseFormat("gemini response has no candidates".to_string()))?;
        let finish_reason = candidate.finish_reason.unwrap_or_default();
        if finish_reason == "SAFETY" {
            return Err(LlmError::Blocked(finish_reason));
        }
        let content: String = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::ResponseFormat(
                "gemini response has empty content".to_string(),
            ));
        }
        let usage = v
            .usage_metadata
            .map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
            })
            .unwrap_or_default();
        Ok(ChatResponse {
            content,
            usage,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case_and_system_instruction() {
        let options = ChatOptions {
            max_tokens: 1024,
            temperature: 0.2,
            json_output: true,
        };
        let req = GeminiRequest::new(
            &[ChatMessage::system("sys"), ChatMessage::user("hello")],
            options,
        )
        .expect("request builds");
        let value = serde_json::to_value(&req).expect("request serializes");
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(
            value["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn blocked_prompt_is_reported() {
        let raw = serde_json::json!({"promptFeedback": {"blockReason": "OTHER"}});
        let parsed: GeminiResponse = serde_json::from_value(raw).expect("response parses");
        let err = ChatResponse::try_from(parsed).expect_err("blocked prompt should fail");
        assert!(matches!(err, LlmError::Blocked(reason) if reason == "OTHER"));
    }

    #[test]
    fn candidate_parts_are_joined() {
        let raw = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "{\"topics\""}, {"text": ":[]}"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 30, "candidatesTokenCount": 5}
        });
        let parsed: GeminiResponse = serde_json::from_value(raw).expect("response parses");
        let resp = ChatResponse::try_from(parsed).expect("response converts");
        assert_eq!(resp.content, "{\"topics\":[]}");
        assert_eq!(resp.usage.prompt_tokens, 30);
        assert_eq!(resp.finish_reason, "STOP");
    }
}
