use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Usage,
    pub finish_reason: String,
}

/// Sampling knobs shared by every provider request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChatOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub json_output: bool,
}

/// Split leading system prompts from the conversation turns.
pub(crate) fn split_system(messages: &[ChatMessage]) -> (String, Vec<&ChatMessage>) {
    let mut system = String::new();
    let mut turns = Vec::with_capacity(messages.len());
    for m in messages {
        if m.role == Role::System {
            if !system.is_empty() {
                system.push('\n');
            }
            system.push_str(m.content.trim());
        } else {
            turns.push(m);
        }
    }
    (system, turns)
}
