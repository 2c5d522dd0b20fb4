use cadence_domain::error::Result;
use cadence_domain::message::{Message, ToolCall, ToolSchema, Usage};
use cadence_domain::stream::{BoxStream, StreamEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send, system prompt first.
    pub messages: Vec<Message>,
    /// Tool schemas the model may invoke.  Empty disables tool binding.
    pub tools: Vec<ToolSchema>,
    /// Sampling temperature.  `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response.  `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Model identifier override.  `None` uses the provider default.
    pub model: Option<String>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Textual content (may be empty for tool-call-only responses).
    pub content: String,
    /// Tool calls emitted by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage information.
    pub usage: Option<Usage>,
    /// The model that actually produced the response.
    pub model: String,
    /// The reason the model stopped (e.g. "stop", "tool_calls").
    pub finish_reason: Option<String>,
    /// Raw provider message payload.  Stored on the assistant history
    /// message and replayed verbatim on the next request.
    pub provider_raw: Option<serde_json::Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter implements.
///
/// Implementations translate between the canonical types and the wire
/// format of the provider's HTTP API.  Errors surface as
/// `Error::ProviderRetryable` / `Error::ProviderFatal` based on the
/// provider's status code and message.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and return a stream of events.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}
