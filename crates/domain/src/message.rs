//! Canonical conversation message form.
//!
//! Every message in a session history is one of these role-tagged records.
//! Tool calls and tool results are correlated through `ToolCall::id` /
//! `Message::tool_call_id`.  The most recent assistant message may carry
//! `provider_raw` — opaque provider metadata that must round-trip verbatim
//! on replay or the provider may reject the request.

use serde::{Deserialize, Serialize};

/// Marker prefix identifying a compaction summary system message.
pub const COMPACTION_MARKER: &str = "[compaction] Previous conversation summary:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single tool call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: gen_call_id(),
            name: name.into(),
            args,
        }
    }
}

/// Generate a unique tool call ID.
pub fn gen_call_id() -> String {
    format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..16])
}

/// Function-calling schema for one tool, as exposed to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Token usage for one LLM call (or the sum across a turn's iterations).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl Usage {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Component-wise sum, used to accumulate per-iteration usage.
    #[must_use]
    pub fn add(&self, other: &Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
            cached_tokens: self.cached_tokens + other.cached_tokens,
            reasoning_tokens: self.reasoning_tokens + other.reasoning_tokens,
        }
    }
}

/// A message in a session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool calls emitted with this message (assistant only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Correlates this tool result to the assistant call that produced it
    /// (tool only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Name of the tool that produced this result (tool only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Usage recorded on the assistant message for the call that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Opaque provider metadata (e.g. thought signatures) for the most
    /// recent assistant turn.  Replayed byte-for-byte.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_raw: Option<serde_json::Value>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::bare(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::bare(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, text)
    }

    /// An assistant message carrying tool calls (content may be empty).
    pub fn assistant_with_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::bare(Role::Assistant, text)
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::bare(Role::Tool, content)
        }
    }

    fn bare(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            usage: None,
            provider_raw: None,
        }
    }

    /// Whether this message is the compaction summary (a single marked
    /// system message — history never contains two).
    pub fn is_compaction_summary(&self) -> bool {
        self.role == Role::System && self.content.starts_with(COMPACTION_MARKER)
    }

    /// Whether this assistant message carries at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }
}

/// Result of a single LLM call made by the invoker.
///
/// `ToolCalls` carries the full assistant message so `provider_raw` survives
/// into history when the tool interaction is appended.
#[derive(Debug, Clone)]
pub enum LlmResult {
    Text {
        text: String,
        usage: Usage,
        assistant: Message,
    },
    ToolCalls {
        calls: Vec<ToolCall>,
        usage: Usage,
        assistant: Message,
    },
}

impl LlmResult {
    pub fn usage(&self) -> Usage {
        match self {
            LlmResult::Text { usage, .. } | LlmResult::ToolCalls { usage, .. } => *usage,
        }
    }
}
