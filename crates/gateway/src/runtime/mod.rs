//! The runtime — approval gate, invoker, turn loop, tool dispatch, and
//! the periodic scheduler.
//!
//! Entry points: [`turn::run_turn`] for a non-streaming turn,
//! [`turn::stream_turn`] for the SSE mirror, and
//! [`scheduler::runner::spawn`] for the beat loop.

pub mod approval;
pub mod files;
pub mod invoker;
pub mod notify;
pub mod scheduler;
pub mod tasks;
pub mod todo;
pub mod tools_exec;
pub mod turn;

use cadence_domain::message::Usage;
use cadence_domain::responses::{
    ErrorObject, OutputItem, ResponseObject, ResponseStatus,
};

/// Assemble a `ResponseObject` with normalized metadata.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_response(
    output: Vec<OutputItem>,
    status: ResponseStatus,
    session_id: &str,
    created_at: i64,
    model: &str,
    usage: Usage,
    error: Option<ErrorObject>,
    iterations: Option<u32>,
    tool_call_count: Option<u64>,
    tool_history: &[OutputItem],
) -> ResponseObject {
    let mut metadata = serde_json::Map::new();
    metadata.insert("session_id".into(), serde_json::json!(session_id));
    if let Some(n) = iterations {
        metadata.insert("iterations".into(), serde_json::json!(n));
    }
    if let Some(n) = tool_call_count {
        metadata.insert("tool_call_count".into(), serde_json::json!(n));
    }
    if !tool_history.is_empty() {
        metadata.insert(
            "tool_history".into(),
            serde_json::to_value(tool_history).unwrap_or_default(),
        );
    }

    ResponseObject {
        id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
        object: "response".into(),
        created_at,
        completed_at: Some(chrono::Utc::now().timestamp()),
        model: model.to_string(),
        status,
        output,
        usage,
        error,
        metadata,
    }
}
