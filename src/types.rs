//! Chat request/response types passed through to the underlying inference
//! client unmodified. Trimmed from the upstream OpenAI-compatible surface to
//! the fields the selection engine and token estimator actually need to
//! inspect; everything else rides along via `extra_params`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }
}

/// A chat completion request. Mirrors the OpenAI/Azure wire shape; any field
/// this crate doesn't model explicitly is preserved via `extra_params` and
/// forwarded verbatim, per the pass-through non-goal.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    /// Opaque session identifier used for affinity routing. Not forwarded to
    /// the underlying inference client.
    #[serde(skip)]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra_params: HashMap<String, serde_json::Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Upper-bound estimate of prompt tokens, used to provisionally account
    /// against a deployment's TPM budget before the authoritative count comes
    /// back from the server. Characters/4 heuristic, plus a flat per-message
    /// overhead and the requested completion allowance.
    pub fn estimate_input_tokens(&self) -> u32 {
        let mut total = 0u32;
        for message in &self.messages {
            total += 4;
            total += (message.content.len() as f64 / 4.0).ceil() as u32;
        }
        total + self.max_tokens.unwrap_or(DEFAULT_COMPLETION_ALLOWANCE)
    }
}

/// Assumed completion length when the caller doesn't supply `max_tokens`.
const DEFAULT_COMPLETION_ALLOWANCE: u32 = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

/// A non-streaming chat completion response, passed back to the caller
/// unmodified apart from the deployment having produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

/// One chunk of a streamed chat completion. The final chunk in a stream
/// carries `usage`, from which the DC reconciles provisional token accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub model: String,
    pub delta: Option<String>,
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_input_tokens_counts_message_overhead_and_completion_allowance() {
        let req = ChatRequest::new("gpt-4o-mini")
            .with_message(ChatMessage::new(MessageRole::User, "hi")); // len 2 -> ceil(2/4)=1
        // 4 (message overhead) + 1 (text) + 256 (default completion allowance)
        assert_eq!(req.estimate_input_tokens(), 4 + 1 + 256);
    }

    #[test]
    fn estimate_input_tokens_uses_explicit_max_tokens() {
        let mut req = ChatRequest::new("gpt-4o-mini")
            .with_message(ChatMessage::new(MessageRole::User, "hello world")); // len 11 -> ceil(11/4)=3
        req.max_tokens = Some(64);
        assert_eq!(req.estimate_input_tokens(), 4 + 3 + 64);
    }
}
