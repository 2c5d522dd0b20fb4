//! Request/response persistence and cost accounting.
//!
//! Stores input items, output items, and `ask_question` rows keyed by
//! call id, then computes per-response cost from the pricing table and
//! rolls usage into the session aggregates.
//!
//! The initial-turn rule: the trailing user message is persisted only when
//! the input carries no tool-result items — follow-up turns re-send it as
//! context and must not duplicate it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_domain::config::ModelPricing;
use cadence_domain::message::{Role, Usage};
use cadence_domain::responses::{
    InputItem, InputPayload, OutputItem, ResponseObject, ResponseStatus,
};
use cadence_sessions::SessionStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub session_id: String,
    pub response_id: String,
    /// "message" | "function_call" | "function_call_output"
    pub kind: String,
    pub role: String,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub call_id: String,
    pub session_id: String,
    pub question: String,
    pub choices: Vec<String>,
    #[serde(default)]
    pub answer_type: Option<String>,
    #[serde(default)]
    pub user_answer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: String,
    pub session_id: String,
    pub model: String,
    pub status: ResponseStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input_cost: f64,
    #[serde(default)]
    pub output_cost: f64,
    #[serde(default)]
    pub total_cost: f64,
}

#[derive(Default, Serialize, Deserialize)]
struct Inner {
    messages: Vec<StoredMessage>,
    questions: HashMap<String, Question>,
    responses: HashMap<String, ResponseRecord>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ResponseStore {
    path: PathBuf,
    pricing: HashMap<String, ModelPricing>,
    inner: RwLock<Inner>,
}

impl ResponseStore {
    pub fn new(state_path: &Path, pricing: HashMap<String, ModelPricing>) -> Self {
        let _ = std::fs::create_dir_all(state_path);
        let path = state_path.join("responses.json");
        let inner = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            pricing,
            inner: RwLock::new(inner),
        }
    }

    fn flush(&self, inner: &Inner) {
        if let Ok(raw) = serde_json::to_string(inner) {
            if let Err(e) = std::fs::write(&self.path, raw) {
                tracing::warn!(error = %e, "failed to persist response store");
            }
        }
    }

    /// Open a response record for an incoming request.
    pub fn begin_response(&self, session_id: &str, model: &str) -> String {
        let id = format!("resp_{}", Uuid::new_v4().simple());
        let mut inner = self.inner.write();
        inner.responses.insert(
            id.clone(),
            ResponseRecord {
                id: id.clone(),
                session_id: session_id.to_string(),
                model: model.to_string(),
                status: ResponseStatus::InProgress,
                created_at: Utc::now(),
                completed_at: None,
                input_cost: 0.0,
                output_cost: 0.0,
                total_cost: 0.0,
            },
        );
        id
    }

    /// Persist the new input items of a request.
    pub fn persist_input(&self, session_id: &str, response_id: &str, input: &InputPayload) {
        let mut inner = self.inner.write();

        match input {
            InputPayload::Text(text) => {
                push_message(
                    &mut inner,
                    session_id,
                    response_id,
                    "message",
                    "user",
                    serde_json::json!([{ "type": "input_text", "text": text }]),
                );
            }
            InputPayload::Items(items) => {
                let has_tool_results = items
                    .iter()
                    .any(|i| matches!(i, InputItem::FunctionCallOutput { .. }));

                for item in items {
                    match item {
                        InputItem::FunctionCall {
                            call_id,
                            name,
                            arguments,
                            ..
                        } => {
                            push_message(
                                &mut inner,
                                session_id,
                                response_id,
                                "function_call",
                                "tool",
                                serde_json::json!({
                                    "call_id": call_id,
                                    "name": name,
                                    "arguments": arguments,
                                }),
                            );
                        }
                        InputItem::FunctionCallOutput { call_id, output, .. } => {
                            push_message(
                                &mut inner,
                                session_id,
                                response_id,
                                "function_call_output",
                                "tool",
                                serde_json::json!({
                                    "call_id": call_id,
                                    "output": output,
                                }),
                            );
                            record_answer(&mut inner, call_id, output);
                        }
                        _ => {}
                    }
                }

                // Initial-turn rule: the trailing user message is context
                // re-send on follow-up turns.
                if !has_tool_results {
                    let last_user = items.iter().rev().find_map(|i| match i {
                        InputItem::Message { role, content } if *role == Role::User => {
                            Some(content.text())
                        }
                        _ => None,
                    });
                    if let Some(text) = last_user {
                        push_message(
                            &mut inner,
                            session_id,
                            response_id,
                            "message",
                            "user",
                            serde_json::json!([{ "type": "input_text", "text": text }]),
                        );
                    }
                }
            }
        }

        self.flush(&inner);
    }

    /// Persist a finished response: output items, question rows for
    /// `ask_question` calls, cost, and session aggregates.  Returns the
    /// computed (input_cost, output_cost, total_cost).
    pub fn persist_output(
        &self,
        resp: &ResponseObject,
        session_id: &str,
        response_id: &str,
        sessions: &SessionStore,
    ) -> (f64, f64, f64) {
        let mut inner = self.inner.write();

        for item in &resp.output {
            match item {
                OutputItem::Message { content, .. } => {
                    push_message(
                        &mut inner,
                        session_id,
                        response_id,
                        "message",
                        "assistant",
                        serde_json::to_value(content).unwrap_or_default(),
                    );
                }
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                    ..
                } => {
                    push_message(
                        &mut inner,
                        session_id,
                        response_id,
                        "function_call",
                        "assistant",
                        serde_json::json!({
                            "call_id": call_id,
                            "name": name,
                            "arguments": arguments,
                        }),
                    );
                    if name == "ask_question" {
                        record_question(&mut inner, session_id, call_id, arguments);
                    }
                }
                OutputItem::FunctionCallOutput { call_id, output, .. } => {
                    push_message(
                        &mut inner,
                        session_id,
                        response_id,
                        "function_call_output",
                        "tool",
                        serde_json::json!({ "call_id": call_id, "output": output }),
                    );
                }
            }
        }

        // Server-side tool traffic from the loop lands in metadata
        // tool_history; persist those items too.
        if let Some(history) = resp.metadata.get("tool_history").and_then(|v| v.as_array()) {
            for item in history {
                let kind = item
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("function_call");
                push_message(
                    &mut inner,
                    session_id,
                    response_id,
                    kind,
                    "tool",
                    item.clone(),
                );
                if item.get("name").and_then(|n| n.as_str()) == Some("ask_question") {
                    if let (Some(call_id), Some(arguments)) = (
                        item.get("call_id").and_then(|c| c.as_str()),
                        item.get("arguments").and_then(|a| a.as_str()),
                    ) {
                        record_question(&mut inner, session_id, call_id, arguments);
                    }
                }
            }
        }

        // Cost from the pricing table, keyed by model name.
        let (input_cost, output_cost) = self
            .pricing
            .get(&resp.model)
            .map(|p| {
                (
                    resp.usage.input_tokens as f64 * p.input_cost_per_mtok / 1_000_000.0,
                    resp.usage.output_tokens as f64 * p.output_cost_per_mtok / 1_000_000.0,
                )
            })
            .unwrap_or((0.0, 0.0));
        let total_cost = input_cost + output_cost;

        if let Some(record) = inner.responses.get_mut(response_id) {
            record.status = resp.status;
            record.completed_at = Some(Utc::now());
            record.input_cost = input_cost;
            record.output_cost = output_cost;
            record.total_cost = total_cost;
        }

        self.flush(&inner);
        drop(inner);

        sessions.record_usage(session_id, &resp.usage, total_cost);
        (input_cost, output_cost, total_cost)
    }

    pub fn mark_failed(&self, response_id: &str) {
        let mut inner = self.inner.write();
        if let Some(record) = inner.responses.get_mut(response_id) {
            record.status = ResponseStatus::Failed;
            record.completed_at = Some(Utc::now());
        }
        self.flush(&inner);
    }

    pub fn question(&self, call_id: &str) -> Option<Question> {
        self.inner.read().questions.get(call_id).cloned()
    }

    pub fn messages_for_session(&self, session_id: &str) -> Vec<StoredMessage> {
        self.inner
            .read()
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn response_record(&self, response_id: &str) -> Option<ResponseRecord> {
        self.inner.read().responses.get(response_id).cloned()
    }
}

fn push_message(
    inner: &mut Inner,
    session_id: &str,
    response_id: &str,
    kind: &str,
    role: &str,
    content: serde_json::Value,
) {
    inner.messages.push(StoredMessage {
        id: Uuid::new_v4(),
        session_id: session_id.to_string(),
        response_id: response_id.to_string(),
        kind: kind.to_string(),
        role: role.to_string(),
        content,
        created_at: Utc::now(),
    });
}

/// Record an `ask_question` row so the answer can be matched later.
fn record_question(inner: &mut Inner, session_id: &str, call_id: &str, arguments: &str) {
    let parsed: serde_json::Value = serde_json::from_str(arguments).unwrap_or_default();
    inner.questions.insert(
        call_id.to_string(),
        Question {
            call_id: call_id.to_string(),
            session_id: session_id.to_string(),
            question: parsed
                .get("question")
                .and_then(|q| q.as_str())
                .unwrap_or("")
                .to_string(),
            choices: parsed
                .get("choices")
                .and_then(|c| c.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            answer_type: None,
            user_answer: None,
        },
    );
}

/// Match a tool-result item back to a stored question and decode its
/// answer type from the client display prefix.
fn record_answer(inner: &mut Inner, call_id: &str, output: &str) {
    let Some(question) = inner.questions.get_mut(call_id) else {
        return;
    };
    if let Some(rest) = output.strip_prefix("User input: ") {
        question.answer_type = Some("user_input".into());
        question.user_answer = Some(rest.to_string());
    } else if let Some(rest) = output.strip_prefix("User chose: ") {
        question.answer_type = Some("choice".into());
        question.user_answer = Some(rest.to_string());
    } else {
        question.user_answer = Some(output.to_string());
    }
}
