//! OpenAI-compatible chat completions adapter.
//!
//! Works with any endpoint following the OpenAI chat completions contract.
//! The raw assistant message JSON is captured as `provider_raw` on every
//! response and replayed verbatim when present on a history message, so
//! provider-specific metadata (thought signatures and the like) survives
//! the round trip untouched.

use serde_json::Value;

use cadence_domain::config::LlmConfig;
use cadence_domain::error::{Error, Result};
use cadence_domain::message::{Message, Role, ToolCall, Usage};
use cadence_domain::stream::{BoxStream, StreamEvent};

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: String,
    default_model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env).unwrap_or_default();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_output_tokens,
            client,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();

        let mut body = serde_json::json!({
            "model": req.model.clone().unwrap_or_else(|| self.default_model.clone()),
            "messages": messages,
            "stream": stream,
            "temperature": req.temperature.unwrap_or(self.temperature),
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(max) = req.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        self.client
            .post(self.chat_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert a canonical message to the wire shape.  An assistant message
/// carrying `provider_raw` is replayed as-is; everything else is built
/// from the canonical fields.
pub(crate) fn msg_to_wire(msg: &Message) -> Value {
    if msg.role == Role::Assistant {
        if let Some(raw) = &msg.provider_raw {
            return raw.clone();
        }
        let mut obj = serde_json::json!({
            "role": "assistant",
            "content": if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) },
        });
        if let Some(calls) = &msg.tool_calls {
            if !calls.is_empty() {
                let wire_calls: Vec<Value> = calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.args.to_string(),
                            }
                        })
                    })
                    .collect();
                obj["tool_calls"] = Value::Array(wire_calls);
            }
        }
        return obj;
    }

    if msg.role == Role::Tool {
        return serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.content,
        });
    }

    serde_json::json!({
        "role": role_str(msg.role),
        "content": msg.content,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::ProviderFatal("no choices in response".into()))?;

    let message = choice
        .get("message")
        .ok_or_else(|| Error::ProviderFatal("no message in choice".into()))?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    Ok(ChatResponse {
        content,
        tool_calls: parse_wire_tool_calls(message),
        usage: body.get("usage").and_then(parse_wire_usage),
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
        provider_raw: Some(message.clone()),
    })
}

pub(crate) fn parse_wire_tool_calls(message: &Value) -> Vec<ToolCall> {
    let Some(arr) = message.get("tool_calls").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|tc| {
            let id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
            let args: Value =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall { id, name, args })
        })
        .collect()
}

pub(crate) fn parse_wire_usage(v: &Value) -> Option<Usage> {
    let input_tokens = v.get("prompt_tokens")?.as_u64()?;
    let output_tokens = v.get("completion_tokens").and_then(|t| t.as_u64()).unwrap_or(0);
    Some(Usage {
        input_tokens,
        output_tokens,
        total_tokens: v
            .get("total_tokens")
            .and_then(|t| t.as_u64())
            .unwrap_or(input_tokens + output_tokens),
        cached_tokens: v
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(|t| t.as_u64())
            .unwrap_or(0),
        reasoning_tokens: v
            .pointer("/completion_tokens_details/reasoning_tokens")
            .and_then(|t| t.as_u64())
            .unwrap_or(0),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates tool-call fragments across stream chunks.  OpenAI keys
/// deltas by `index`, with the call id only on the first fragment.
#[derive(Default)]
struct StreamState {
    // index -> (call_id, name, args buffer)
    calls: Vec<(String, String, String)>,
    finished_emitted: bool,
}

impl StreamState {
    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        if data.trim() == "[DONE]" {
            return Vec::new();
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        let choice = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first());

        // Usage-only chunk (stream_options.include_usage).
        let Some(choice) = choice else {
            if let Some(usage) = v.get("usage").and_then(parse_wire_usage) {
                return vec![Ok(StreamEvent::Done {
                    usage: Some(usage),
                    finish_reason: None,
                    provider_raw: None,
                })];
            }
            return Vec::new();
        };

        let mut events = Vec::new();
        let delta = choice.get("delta").unwrap_or(&Value::Null);

        if let Some(tc_arr) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for tc in tc_arr {
                let idx = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                while self.calls.len() <= idx {
                    self.calls.push(Default::default());
                }
                if let Some(id) = tc.get("id").and_then(|i| i.as_str()) {
                    let name = tc
                        .pointer("/function/name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("");
                    self.calls[idx].0 = id.to_string();
                    self.calls[idx].1 = name.to_string();
                    events.push(Ok(StreamEvent::ToolCallStarted {
                        call_id: id.to_string(),
                        tool_name: name.to_string(),
                    }));
                }
                if let Some(args) = tc.pointer("/function/arguments").and_then(|a| a.as_str()) {
                    self.calls[idx].2.push_str(args);
                    events.push(Ok(StreamEvent::ToolCallDelta {
                        call_id: self.calls[idx].0.clone(),
                        delta: args.to_string(),
                    }));
                }
            }
        }

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token {
                    text: text.to_string(),
                }));
            }
        }

        if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            if !self.finished_emitted {
                self.finished_emitted = true;
                for (call_id, name, args_buf) in self.calls.drain(..) {
                    let arguments: Value = serde_json::from_str(&args_buf)
                        .unwrap_or(Value::Object(Default::default()));
                    events.push(Ok(StreamEvent::ToolCallFinished {
                        call_id,
                        tool_name: name,
                        arguments,
                    }));
                }
            }
            events.push(Ok(StreamEvent::Done {
                usage: v.get("usage").and_then(parse_wire_usage),
                finish_reason: Some(fr.to_string()),
                provider_raw: None,
            }));
        }

        events
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(req, false);
        tracing::debug!(url = %self.chat_url(), messages = req.messages.len(), "chat request");

        let resp = self.post(&body).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            let msg = format!("HTTP {} - {}", status.as_u16(), text);
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                Error::ProviderRetryable(msg)
            } else {
                Error::ProviderFatal(msg)
            });
        }

        parse_chat_response(&serde_json::from_str(&text)?)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_body(req, true);
        tracing::debug!(url = %self.chat_url(), messages = req.messages.len(), "stream request");

        let resp = self.post(&body).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
            let msg = format!("HTTP {} - {}", status.as_u16(), text);
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                Error::ProviderRetryable(msg)
            } else {
                Error::ProviderFatal(msg)
            });
        }

        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            state.parse(data)
        }))
    }

    fn provider_id(&self) -> &str {
        "openai_compat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_with_provider_raw_replays_verbatim() {
        let raw = serde_json::json!({
            "role": "assistant",
            "content": "hi",
            "extra_metadata": {"thought_signature": "sig"},
        });
        let mut msg = Message::assistant("hi");
        msg.provider_raw = Some(raw.clone());
        assert_eq!(msg_to_wire(&msg), raw);
    }

    #[test]
    fn assistant_tool_calls_serialize_arguments_as_string() {
        let msg = Message::assistant_with_calls(
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "bash".into(),
                args: serde_json::json!({"command": "ls"}),
            }],
        );
        let wire = msg_to_wire(&msg);
        assert_eq!(wire["content"], Value::Null);
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "bash");
        assert_eq!(
            wire["tool_calls"][0]["function"]["arguments"],
            "{\"command\":\"ls\"}"
        );
    }

    #[test]
    fn tool_message_carries_call_id() {
        let msg = Message::tool_result("c1", "bash", "a\nb");
        let wire = msg_to_wire(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c1");
        assert_eq!(wire["content"], "a\nb");
    }

    #[test]
    fn parse_response_captures_provider_raw() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Hello!",
                    "signature": "opaque",
                },
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
        });
        let resp = parse_chat_response(&body).unwrap();
        assert_eq!(resp.content, "Hello!");
        assert_eq!(resp.usage.unwrap().total_tokens, 15);
        assert_eq!(resp.provider_raw.unwrap()["signature"], "opaque");
    }

    #[test]
    fn parse_usage_with_details() {
        let usage = parse_wire_usage(&serde_json::json!({
            "prompt_tokens": 100,
            "completion_tokens": 20,
            "total_tokens": 120,
            "prompt_tokens_details": {"cached_tokens": 80},
            "completion_tokens_details": {"reasoning_tokens": 5},
        }))
        .unwrap();
        assert_eq!(usage.cached_tokens, 80);
        assert_eq!(usage.reasoning_tokens, 5);
    }

    #[test]
    fn stream_state_assembles_split_tool_call() {
        let mut state = StreamState::default();

        let first = state.parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"bash","arguments":""}}]}}]}"#,
        );
        assert!(matches!(
            first[0],
            Ok(StreamEvent::ToolCallStarted { ref call_id, .. }) if call_id == "c1"
        ));

        state.parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"command\":"}}]}}]}"#,
        );
        state.parse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"ls\"}"}}]}}]}"#,
        );

        let finish = state.parse(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        let finished = finish
            .iter()
            .find_map(|e| match e {
                Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }) => Some((call_id.clone(), tool_name.clone(), arguments.clone())),
                _ => None,
            })
            .expect("expected ToolCallFinished");
        assert_eq!(finished.0, "c1");
        assert_eq!(finished.1, "bash");
        assert_eq!(finished.2, serde_json::json!({"command": "ls"}));
    }

    #[test]
    fn stream_usage_only_chunk_yields_done() {
        let mut state = StreamState::default();
        let events = state.parse(
            r#"{"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":3,"total_tokens":12}}"#,
        );
        assert!(matches!(
            events[0],
            Ok(StreamEvent::Done { usage: Some(u), .. }) if u.total_tokens == 12
        ));
    }
}
