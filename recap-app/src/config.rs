//! Recap configuration loader.
//!
//! TOML file, then environment overrides, then validation.

use recap_llm::{Provider, detect_provider};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on summarizer retries after the first attempt.
pub const MAX_SUMMARIZER_RETRIES: u32 = 2;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecapConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub slack: SlackConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
        }
    }
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub slack_bot_token: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    /// Hard bound on the slash-command acknowledgment path.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    10
}

fn default_http_max_in_flight() -> usize {
    256
}

fn default_ack_timeout_ms() -> u64 {
    2500
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.recap/data".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// How far back a complete summary (or a first unread summary) looks.
    pub window_hours: u64,
    pub job_budget_seconds: u64,
    pub fetch_timeout_seconds: u64,
    pub summarize_timeout_seconds: u64,
    pub delivery_timeout_seconds: u64,
    pub source_retries: u32,
    pub summarizer_retries: u32,
    pub delivery_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// How long terminal jobs stay in the in-flight table for duplicate detection.
    pub retention_seconds: u64,
    pub max_contributors: usize,
    pub max_transcript_chars: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            job_budget_seconds: 120,
            fetch_timeout_seconds: 20,
            summarize_timeout_seconds: 45,
            delivery_timeout_seconds: 10,
            source_retries: 2,
            summarizer_retries: MAX_SUMMARIZER_RETRIES,
            delivery_retries: 2,
            retry_base_ms: 500,
            retry_max_ms: 8000,
            retention_seconds: 60,
            max_contributors: 5,
            max_transcript_chars: 60_000,
        }
    }
}

impl JobsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_hours.saturating_mul(3600))
    }

    pub fn summarizer_retries(&self) -> u32 {
        self.summarizer_retries.min(MAX_SUMMARIZER_RETRIES)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub page_limit: usize,
    pub max_pages: usize,
    pub page_delay_ms: u64,
    pub channel_cache_ttl_seconds: u64,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            page_limit: 200,
            max_pages: 10,
            page_delay_ms: 500,
            channel_cache_ttl_seconds: 3600,
        }
    }
}

impl RecapConfig {
    /// Load from `path`, or from `~/.recap/config.toml` when no path is given.
    ///
    /// A missing default file is not an error: every setting has a default and
    /// credentials usually arrive through the environment.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml_str(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(config_path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("RECAP_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = non_empty("RECAP_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = non_empty("SLACK_BOT_TOKEN") {
            self.keys.slack_bot_token = Some(v);
        }
        if let Some(v) = non_empty("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = non_empty("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = non_empty("GEMINI_API_KEY") {
            self.keys.gemini_api_key = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        self.bind_addr()?;
        if self.slack_bot_token().is_none() {
            return Err(anyhow::anyhow!(
                "keys.slack_bot_token is required (or set SLACK_BOT_TOKEN)"
            ));
        }
        if self.api_key_for_model().is_none() {
            return Err(anyhow::anyhow!(
                "no api key configured for model {} ({})",
                self.general.model,
                provider_key_hint(detect_provider(&self.general.model))
            ));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.server.ack_timeout_ms == 0 {
            return Err(anyhow::anyhow!("server.ack_timeout_ms must be > 0"));
        }
        let jobs = &self.jobs;
        for (name, value) in [
            ("jobs.window_hours", jobs.window_hours),
            ("jobs.job_budget_seconds", jobs.job_budget_seconds),
            ("jobs.fetch_timeout_seconds", jobs.fetch_timeout_seconds),
            ("jobs.summarize_timeout_seconds", jobs.summarize_timeout_seconds),
            ("jobs.delivery_timeout_seconds", jobs.delivery_timeout_seconds),
            ("jobs.retry_base_ms", jobs.retry_base_ms),
        ] {
            if value == 0 {
                return Err(anyhow::anyhow!("{name} must be > 0"));
            }
        }
        if jobs.retry_max_ms < jobs.retry_base_ms {
            return Err(anyhow::anyhow!("jobs.retry_max_ms must be >= jobs.retry_base_ms"));
        }
        if jobs.max_contributors == 0 || jobs.max_transcript_chars == 0 {
            return Err(anyhow::anyhow!(
                "jobs.max_contributors and jobs.max_transcript_chars must be > 0"
            ));
        }
        if self.slack.page_limit == 0 || self.slack.max_pages == 0 {
            return Err(anyhow::anyhow!("slack.page_limit and slack.max_pages must be > 0"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("server.bind_addr {:?} is invalid: {e}", self.server.bind_addr))
    }

    pub fn slack_bot_token(&self) -> Option<String> {
        self.keys
            .slack_bot_token
            .clone()
            .filter(|s| !s.trim().is_empty())
    }

    pub fn api_key_for_model(&self) -> Option<String> {
        let key = match detect_provider(&self.general.model) {
            Provider::Anthropic => &self.keys.anthropic_api_key,
            Provider::Gemini => &self.keys.gemini_api_key,
            Provider::OpenAI => &self.keys.openai_api_key,
        };
        key.clone().filter(|s| !s.trim().is_empty())
    }

    pub fn data_dir_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.storage.data_dir)
    }

    pub fn read_state_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self.data_dir_path()?.join("read_state.sqlite3"))
    }
}

fn provider_key_hint(provider: Provider) -> &'static str {
    match provider {
        Provider::Anthropic => "set keys.anthropic_api_key or ANTHROPIC_API_KEY",
        Provider::Gemini => "set keys.gemini_api_key or GEMINI_API_KEY",
        Provider::OpenAI => "set keys.openai_api_key or OPENAI_API_KEY",
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".recap").join("config.toml")
}

fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen("~", &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn configured(toml: &str) -> RecapConfig {
        RecapConfig::from_toml_str(toml).expect("config should parse")
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = configured("");
        assert_eq!(cfg.general.model, "gemini-1.5-flash");
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:8000");
        assert_eq!(cfg.server.ack_timeout_ms, 2500);
        assert_eq!(cfg.jobs.window_hours, 24);
        assert_eq!(cfg.jobs.retention_seconds, 60);
        assert_eq!(cfg.slack.page_limit, 200);
        assert_eq!(cfg.jobs.window(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let cfg = configured(
            r#"
            [jobs]
            window_hours = 6
            summarizer_retries = 9

            [slack]
            page_delay_ms = 0
            "#,
        );
        assert_eq!(cfg.jobs.window_hours, 6);
        assert_eq!(cfg.jobs.job_budget_seconds, 120);
        assert_eq!(cfg.jobs.summarizer_retries(), MAX_SUMMARIZER_RETRIES);
        assert_eq!(cfg.slack.page_delay_ms, 0);
        assert_eq!(cfg.slack.max_pages, 10);
    }

    #[test]
    fn validate_requires_slack_token_and_provider_key() {
        let mut cfg = configured("");
        let err = cfg.validate().expect_err("missing slack token should fail");
        assert!(err.to_string().contains("slack_bot_token"));

        cfg.keys.slack_bot_token = Some("xoxb-test".to_string());
        let err = cfg.validate().expect_err("missing gemini key should fail");
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        cfg.keys.gemini_api_key = Some("g-test".to_string());
        cfg.validate().expect("fully keyed config should validate");
    }

    #[test]
    fn api_key_follows_model_provider() {
        let cfg = configured(
            r#"
            [general]
            model = "claude-3-5-haiku-latest"

            [keys]
            openai_api_key = "sk-openai"
            anthropic_api_key = "sk-ant"
            "#,
        );
        assert_eq!(cfg.api_key_for_model().as_deref(), Some("sk-ant"));
    }

    #[test]
    fn env_overrides_ignore_blank_values() {
        let mut cfg = configured(
            r#"
            [keys]
            slack_bot_token = "xoxb-file"
            "#,
        );
        let env: HashMap<&str, &str> = HashMap::from([
            ("RECAP_MODEL", "gpt-4o-mini"),
            ("SLACK_BOT_TOKEN", "   "),
            ("OPENAI_API_KEY", "sk-env"),
            ("RECAP_BIND_ADDR", "0.0.0.0:9000"),
        ]);
        cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(cfg.general.model, "gpt-4o-mini");
        assert_eq!(cfg.keys.slack_bot_token.as_deref(), Some("xoxb-file"));
        assert_eq!(cfg.api_key_for_model().as_deref(), Some("sk-env"));
        assert_eq!(
            cfg.bind_addr().expect("bind addr parses"),
            "0.0.0.0:9000".parse::<SocketAddr>().expect("literal parses")
        );
        cfg.validate().expect("overridden config should validate");
    }

    #[test]
    fn validate_rejects_zero_budgets_and_bad_bind_addr() {
        let mut cfg = configured(
            r#"
            [keys]
            slack_bot_token = "xoxb"
            gemini_api_key = "g"

            [jobs]
            job_budget_seconds = 0
            "#,
        );
        let err = cfg.validate().expect_err("zero budget should fail");
        assert!(err.to_string().contains("jobs.job_budget_seconds"));

        cfg.jobs.job_budget_seconds = 30;
        cfg.server.bind_addr = "localhost".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn read_state_lives_under_data_dir() {
        let mut cfg = configured("");
        cfg.storage.data_dir = "/var/lib/recap".to_string();
        assert_eq!(
            cfg.read_state_path().expect("path resolves"),
            PathBuf::from("/var/lib/recap/read_state.sqlite3")
        );
    }
}
