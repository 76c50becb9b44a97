//! The `ChatLLM` capability (§6): tool-calling chat completion over an
//! abstract provider. The core ships no concrete provider — only the trait
//! and the message/response wire types every node builds on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, as produced by the provider.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, name: &str, content: &str) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
            name: Some(name.to_string()),
        }
    }
}

/// An OpenAI-style tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
}

/// What the model produced: either final text, or a request to call tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChatResponse {
    Content(String),
    ToolCalls(Vec<ToolCall>),
}

impl ChatResponse {
    /// A best-effort text view, used when a caller needs a string
    /// regardless of whether the model chose to call tools.
    pub fn text(&self) -> Option<&str> {
        match self {
            ChatResponse::Content(s) => Some(s.as_str()),
            ChatResponse::ToolCalls(_) => None,
        }
    }
}

/// Tool-calling chat completion, with optional JSON-shaped structured output.
///
/// `structured_output`, when requested, asks the provider to additionally
/// parse its own final text into the given JSON schema; providers that
/// cannot do this natively may return `None` and let the caller parse text.
#[async_trait]
pub trait ChatLLM: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<ChatResponse, CoreError>;
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed script of responses, one per call, recording the
    /// messages it was invoked with for assertions.
    pub struct ScriptedLLM {
        responses: Vec<ChatResponse>,
        cursor: AtomicUsize,
        pub calls: Mutex<Vec<Vec<ChatMessage>>>,
        pub fail_after: Option<usize>,
    }

    impl ScriptedLLM {
        pub fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses,
                cursor: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                fail_after: None,
            }
        }
    }

    #[async_trait]
    impl ChatLLM for ScriptedLLM {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolSchema],
        ) -> Result<ChatResponse, CoreError> {
            self.calls.lock().unwrap().push(messages.to_vec());
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_after {
                if idx >= limit {
                    return Err(CoreError::LLMFailure("scripted failure".into()));
                }
            }
            self.responses
                .get(idx)
                .cloned()
                .ok_or_else(|| CoreError::LLMFailure("scripted LLM ran out of responses".into()))
        }
    }
}
