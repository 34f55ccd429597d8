use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::gemini::GeminiClient;
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatOptions, ChatResponse};
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
    Gemini,
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    client: reqwest::Client,
    options: ChatOptions,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(LlmError::InvalidInput("api key is required".to_string()));
        }
        let model = model.trim();
        if model.is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        Ok(Self {
            provider: detect_provider(model),
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: build_http_client(DEFAULT_REQUEST_TIMEOUT)?,
            options: ChatOptions {
                max_tokens: 2048,
                temperature: 0.2,
                json_output: false,
            },
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = build_http_client(timeout)?;
        Ok(self)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.max_tokens = max_tokens.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Ask the provider for a bare JSON object where the API supports it.
    pub fn with_json_output(mut self, json_output: bool) -> Self {
        self.options.json_output = json_output;
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = ?self.provider, model = %self.model))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("messages must not be empty".to_string()));
        }
        let started = std::time::Instant::now();
        let result = match self.provider {
            Provider::OpenAI => {
                OpenAiClient::new(self.client.clone(), &self.api_key, &self.model)
                    .chat(messages, self.options)
                    .await
            }
            Provider::Anthropic => {
                AnthropicClient::new(self.client.clone(), &self.api_key, &self.model)
                    .chat(messages, self.options)
                    .await
            }
            Provider::Gemini => {
                GeminiClient::new(self.client.clone(), &self.api_key, &self.model)
                    .chat(messages, self.options)
                    .await
            }
        };
        match &result {
            Ok(resp) => tracing::debug!(
                latency_ms = started.elapsed().as_millis() as u64,
                prompt_tokens = resp.usage.prompt_tokens,
                completion_tokens = resp.usage.completion_tokens,
                finish_reason = %resp.finish_reason,
                "llm chat completed"
            ),
            Err(error) => tracing::warn!(
                %error,
                transient = error.is_transient(),
                latency_ms = started.elapsed().as_millis() as u64,
                "llm chat failed"
            ),
        }
        result
    }
}

fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LlmError::InvalidInput(format!("build http client: {e}")))
}

pub fn detect_provider(model: &str) -> Provider {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude-") {
        return Provider::Anthropic;
    }
    if m.starts_with("gemini-") {
        return Provider::Gemini;
    }
    Provider::OpenAI
}
