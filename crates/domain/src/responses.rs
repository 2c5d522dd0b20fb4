//! Wire schema for `POST /v1/responses` (Open Responses style).
//!
//! Input items are discriminated by `type`; output items carry generated
//! ids so the client can reference them in follow-up turns.

use serde::{Deserialize, Serialize};

use crate::message::{Role, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub input: InputPayload,
    #[serde(default)]
    pub tools: Option<Vec<ToolDef>>,
    #[serde(default)]
    pub previous_response_id: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default)]
    pub truncation: Option<String>,
}

impl ResponseRequest {
    /// `metadata.session_id`, when present and a string.
    pub fn session_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("session_id"))
            .and_then(|v| v.as_str())
    }

    /// Tool names declared on the request.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|t| t.function.name.clone())
            .collect()
    }
}

/// `input` is either a bare user string or a list of typed items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputPayload {
    Text(String),
    Items(Vec<InputItem>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message {
        role: Role,
        content: InputContent,
    },
    /// Echo of a prior assistant tool call (used for echo recovery when
    /// the session history is gone).
    FunctionCall {
        #[serde(default)]
        id: Option<String>,
        call_id: String,
        name: String,
        arguments: String,
        #[serde(default)]
        status: Option<ItemStatus>,
    },
    /// A tool result produced by the client.
    FunctionCallOutput {
        #[serde(default)]
        id: Option<String>,
        call_id: String,
        output: String,
        #[serde(default)]
        status: Option<ItemStatus>,
    },
    /// Reasoning items are discarded by the runner.
    Reasoning {
        #[serde(default)]
        id: Option<String>,
    },
    /// Item references are discarded by the runner.
    ItemReference {
        #[serde(default)]
        id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputContent {
    Text(String),
    Parts(Vec<InputContentPart>),
}

impl InputContent {
    /// Join all text parts into one string.
    pub fn text(&self) -> String {
        match self {
            InputContent::Text(t) => t.clone(),
            InputContent::Parts(parts) => parts
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

/// Tool declaration on the request (OpenAI function-calling shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: ToolFunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
}

fn default_tool_type() -> String {
    "function".into()
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Queued,
    InProgress,
    Completed,
    Incomplete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InProgress,
    Completed,
    Incomplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl ErrorObject {
    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            kind: "server_error".into(),
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(kind: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        id: String,
        role: Role,
        status: ItemStatus,
        content: Vec<OutputContent>,
    },
    FunctionCall {
        id: String,
        call_id: String,
        name: String,
        /// Arguments serialized as a JSON string.
        arguments: String,
        status: ItemStatus,
    },
    FunctionCallOutput {
        id: String,
        call_id: String,
        output: String,
        status: ItemStatus,
    },
}

impl OutputItem {
    /// An assistant text message output item.
    pub fn text_message(text: impl Into<String>, status: ItemStatus) -> Self {
        OutputItem::Message {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            role: Role::Assistant,
            status,
            content: vec![OutputContent::output_text(text)],
        }
    }

    /// A function_call output item.  `args` is serialized to a JSON string.
    pub fn function_call(
        name: impl Into<String>,
        args: &serde_json::Value,
        call_id: impl Into<String>,
    ) -> Self {
        OutputItem::FunctionCall {
            id: format!("fc_{}", uuid::Uuid::new_v4().simple()),
            call_id: call_id.into(),
            name: name.into(),
            arguments: serde_json::to_string(args).unwrap_or_else(|_| "{}".into()),
            status: ItemStatus::Completed,
        }
    }

    /// A function_call_output item.
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        OutputItem::FunctionCallOutput {
            id: format!("out_{}", uuid::Uuid::new_v4().simple()),
            call_id: call_id.into(),
            output: output.into(),
            status: ItemStatus::Completed,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            OutputItem::FunctionCall { call_id, .. }
            | OutputItem::FunctionCallOutput { call_id, .. } => Some(call_id),
            OutputItem::Message { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub annotations: Vec<serde_json::Value>,
}

impl OutputContent {
    pub fn output_text(text: impl Into<String>) -> Self {
        Self {
            kind: "output_text".into(),
            text: text.into(),
            annotations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseObject {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    pub model: String,
    pub status: ResponseStatus,
    pub output: Vec<OutputItem>,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ResponseObject {
    /// Extract the concatenated text of all message output items.
    pub fn output_text(&self) -> String {
        let mut out = String::new();
        for item in &self.output {
            if let OutputItem::Message { content, .. } = item {
                for part in content {
                    out.push_str(&part.text);
                }
            }
        }
        out
    }
}
