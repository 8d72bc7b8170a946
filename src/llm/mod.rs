//! Language-model and image-model collaborator interfaces.
//!
//! The engine consumes model backends through trait objects; it never
//! talks to a provider wire format itself. Requests are normalized
//! (messages + sampling parameters, or prompt + image references) and
//! responses come back either complete or as a delta stream the engine
//! forwards as CHUNK events.

pub mod plumbing;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::JsonMap;

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Create a simple text message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Assistant message carrying tool-call requests.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Tool-result message answering a specific tool call.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

/// Function call details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON string. May be empty for no-argument functions.
    #[serde(default)]
    pub arguments: String,
}

/// Tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

impl ToolDefinition {
    /// Build a `function`-typed tool definition.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Function definition with its parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Token usage information (if the provider reports it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Sampling parameters for chat completions.
///
/// Intentionally conservative; anything a backend does not understand it
/// is free to ignore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

/// A normalized chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<ToolDefinition>>,
    /// Provider-shaped tool-choice value (`"auto"`, `"none"`, or a
    /// function selector object).
    pub tool_choice: Option<Value>,
    /// Provider-shaped response-format value; the router's constrained
    /// pass sets a JSON-schema format here.
    pub response_format: Option<Value>,
    pub options: ChatOptions,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: None,
            tool_choice: None,
            response_format: None,
            options: ChatOptions::default(),
        }
    }
}

/// Final response from a chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

/// One element of a streamed chat completion.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A text delta in generation order.
    Delta(String),
    /// Usage accounting, emitted at most once.
    Usage(TokenUsage),
    /// Terminal chunk carrying the assembled response (full content,
    /// tool calls, finish reason).
    Done(ChatResponse),
}

/// A stream of chat chunks ending with [`StreamChunk::Done`].
pub type ChatStream = BoxStream<'static, anyhow::Result<StreamChunk>>;

/// Trait for language-model backends.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request, streaming deltas.
    async fn chat_stream(&self, request: ChatRequest) -> anyhow::Result<ChatStream>;

    /// Send a chat completion request and wait for the full response.
    ///
    /// Default implementation drains [`chat_stream`](Self::chat_stream).
    async fn chat(&self, request: ChatRequest) -> anyhow::Result<ChatResponse> {
        let mut stream = self.chat_stream(request).await?;
        let mut usage = None;
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Delta(_) => {}
                StreamChunk::Usage(u) => usage = Some(u),
                StreamChunk::Done(mut response) => {
                    if response.usage.is_none() {
                        response.usage = usage;
                    }
                    return Ok(response);
                }
            }
        }
        anyhow::bail!("model stream ended without a terminal chunk")
    }
}

/// A normalized image generation request.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub model: Option<String>,
    pub prompt: String,
    /// Stable placeholder map (`image-1` ..) for reference images the
    /// prompt mentions.
    pub images: BTreeMap<String, String>,
    /// Remaining generation parameters (size, quality, ...).
    pub params: JsonMap,
}

/// Trait for image-model backends.
#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Generate images, returning their URLs.
    async fn generate(&self, request: ImageRequest) -> anyhow::Result<Vec<String>>;
}
