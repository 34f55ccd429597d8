//! BYO-key LLM client for Recap.
//!
//! Pure HTTP, non-streaming chat completions against OpenAI, Anthropic and
//! Gemini. Callers decide what to retry via [`LlmError::is_transient`].

mod anthropic;
mod client;
mod error;
mod gemini;
mod openai;
mod types;

pub use client::{LlmClient, Provider, detect_provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
