//! The turn orchestrator.
//!
//! One request turn: parse input items, resolve the session, settle any
//! pending approval, then drive bounded LLM iterations — dispatching
//! server-side tool calls in parallel, applying chain rules, deferring
//! client-side calls — until the model returns text, an approval is
//! needed, or the iteration cap is hit.
//!
//! [`run_turn`] is the non-streaming entry; [`stream_turn`] mirrors the
//! same state machine over an event channel.  [`run_headless_turn`] is the
//! scheduler's entry: a synthetic turn with no user present.

use std::collections::HashSet;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use cadence_domain::error::{Error, Result};
use cadence_domain::message::{LlmResult, Message, Role, ToolCall, Usage};
use cadence_domain::responses::{
    ErrorObject, InputItem, InputPayload, ItemStatus, OutputItem, ResponseObject,
    ResponseRequest, ResponseStatus,
};
use cadence_domain::stream::StreamEvent;
use cadence_tools::catalog::{AGENT_TOOLS, SESSION_FILE_TOOLS};
use futures_util::StreamExt;

use super::approval::ApprovalResume;
use super::build_response;
use crate::prompts::HEADLESS_INSTRUCTIONS;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse request input items into messages.  `function_call` echoes are
/// held aside for echo recovery; reasoning and item-reference items are
/// discarded.
pub fn parse_input(request: &ResponseRequest) -> Vec<Message> {
    match &request.input {
        InputPayload::Text(text) => vec![Message::user(text.clone())],
        InputPayload::Items(items) => items
            .iter()
            .filter_map(|item| match item {
                InputItem::Message { role, content } => Some(Message {
                    role: *role,
                    content: content.text(),
                    tool_calls: None,
                    tool_call_id: None,
                    tool_name: None,
                    usage: None,
                    provider_raw: None,
                }),
                InputItem::FunctionCallOutput { call_id, output, .. } => Some(Message {
                    role: Role::Tool,
                    content: output.clone(),
                    tool_calls: None,
                    tool_call_id: Some(call_id.clone()),
                    tool_name: None,
                    usage: None,
                    provider_raw: None,
                }),
                InputItem::FunctionCall { .. }
                | InputItem::Reasoning { .. }
                | InputItem::ItemReference { .. } => None,
            })
            .collect(),
    }
}

/// Rebuild an assistant tool-call message from echoed `function_call`
/// items (used when the session history is gone).
pub fn parse_tool_call_echoes(request: &ResponseRequest) -> Option<Message> {
    let InputPayload::Items(items) = &request.input else {
        return None;
    };

    let calls: Vec<ToolCall> = items
        .iter()
        .filter_map(|item| match item {
            InputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => Some(ToolCall {
                id: call_id.clone(),
                name: name.clone(),
                args: serde_json::from_str(arguments)
                    .unwrap_or(Value::Object(Default::default())),
            }),
            _ => None,
        })
        .collect();

    if calls.is_empty() {
        None
    } else {
        Some(Message::assistant_with_calls("", calls))
    }
}

/// Union of request-declared tools, externally discovered tools,
/// session-file tools, and agent-internal tools.
fn resolve_tool_names(state: &AppState, request: &ResponseRequest) -> Vec<String> {
    let mut names = request.tool_names();
    for name in state.catalog.external_names() {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    for name in SESSION_FILE_TOOLS.iter().chain(AGENT_TOOLS) {
        if !names.iter().any(|n| n == name) {
            names.push((*name).to_string());
        }
    }
    names
}

/// Normalize incoming messages for new-turn vs continuation semantics.
///
/// - Empty history + echoed tool calls: interleave the reconstructed
///   assistant between user messages and trailing tool results so the
///   provider sees `[user, assistant{tool_calls}, tool, …]`.
/// - Existing history + incoming tool results: apply them through
///   `replace_tool_result` and consume them (nothing forwarded).
/// - Otherwise drop messages that already appear in history verbatim.
fn prepare_messages_for_session(
    state: &AppState,
    request: &ResponseRequest,
    session_id: &str,
    messages: Vec<Message>,
) -> Vec<Message> {
    let history = state.sessions.history(session_id);

    if history.is_empty() {
        if let Some(echo) = parse_tool_call_echoes(request) {
            let (tool_results, non_tool): (Vec<Message>, Vec<Message>) =
                messages.into_iter().partition(|m| m.role == Role::Tool);
            tracing::info!(
                session_id,
                calls = echo.tool_calls.as_ref().map(Vec::len).unwrap_or(0),
                "recovered tool call echo(es)"
            );
            let mut rebuilt = non_tool;
            rebuilt.push(echo);
            rebuilt.extend(tool_results);
            return rebuilt;
        }
        return messages;
    }

    let tool_results: Vec<&Message> = messages.iter().filter(|m| m.role == Role::Tool).collect();
    if !tool_results.is_empty() {
        for tr in tool_results {
            state.sessions.replace_tool_result(
                session_id,
                tr.tool_call_id.as_deref().unwrap_or(""),
                &tr.content,
                tr.tool_name.as_deref(),
            );
        }
        return Vec::new();
    }

    let seen: HashSet<(Role, &str)> = history
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    messages
        .into_iter()
        .filter(|m| !seen.contains(&(m.role, m.content.as_str())))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loop context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LoopContext {
    session_id: String,
    created_at: i64,
    model: String,
    instructions: Option<String>,
    messages: Vec<Message>,
    tool_names: Vec<String>,
    total_usage: Usage,
    tool_call_count: u64,
    output_items: Vec<OutputItem>,
}

impl LoopContext {
    /// Instructions augmented with the current TODO state block.
    fn augmented_instructions(&self, state: &AppState) -> Option<String> {
        let base = self.instructions.clone().unwrap_or_default();
        match state.todo.state_prompt(&self.session_id) {
            Some(todo_block) if base.is_empty() => Some(todo_block),
            Some(todo_block) => Some(format!("{base}\n\n{todo_block}")),
            None if base.is_empty() => None,
            None => Some(base),
        }
    }

    fn response(
        &self,
        output: Vec<OutputItem>,
        status: ResponseStatus,
        iterations: Option<u32>,
    ) -> ResponseObject {
        build_response(
            output,
            status,
            &self.session_id,
            self.created_at,
            &self.model,
            self.total_usage,
            None,
            iterations,
            Some(self.tool_call_count),
            &self.output_items,
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Non-streaming entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run a full turn.  Unhandled errors surface as a response whose status
/// is `failed` — the transport always sees a response object.
pub async fn run_turn(state: &AppState, request: &ResponseRequest) -> ResponseObject {
    let created_at = Utc::now().timestamp();
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.config.llm.model.clone());

    // Evicted sessions take their runtime state (pending approvals, chain
    // cursors, TODO plans) with them.
    for evicted in state.sessions.evict() {
        state.clear_session_state(&evicted);
    }
    let session_id = state.sessions.get_or_create(request.session_id());

    match run_turn_inner(state, request, &session_id, created_at, &model).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(%session_id, error = %e, "turn failed");
            build_response(
                vec![],
                ResponseStatus::Failed,
                &session_id,
                created_at,
                &model,
                Usage::zero(),
                Some(ErrorObject::with_code(
                    "server_error",
                    e.code(),
                    e.to_string(),
                )),
                None,
                None,
                &[],
            )
        }
    }
}

async fn run_turn_inner(
    state: &AppState,
    request: &ResponseRequest,
    session_id: &str,
    created_at: i64,
    model: &str,
) -> Result<ResponseObject> {
    let messages = parse_input(request);
    if messages.is_empty() && parse_tool_call_echoes(request).is_none() {
        return Ok(build_response(
            vec![],
            ResponseStatus::Failed,
            session_id,
            created_at,
            model,
            Usage::zero(),
            Some(ErrorObject {
                kind: "invalid_request".into(),
                code: None,
                message: "No input messages".into(),
            }),
            None,
            None,
            &[],
        ));
    }

    let mut ctx = LoopContext {
        session_id: session_id.to_string(),
        created_at,
        model: model.to_string(),
        instructions: request.instructions.clone(),
        messages,
        tool_names: resolve_tool_names(state, request),
        total_usage: Usage::zero(),
        tool_call_count: 0,
        output_items: Vec::new(),
    };

    // The loop lock serializes the whole turn for this session.
    let lock = state.sessions.loop_lock(session_id);
    let _guard = lock.lock().await;

    // Pending approval must be settled before history normalization: the
    // answer arrives as a tool message that replace_tool_result would
    // otherwise consume.
    if state.approval.has_pending(session_id) {
        if let Some(resume) = state
            .approval
            .handle_response(session_id, &ctx.messages.clone())
        {
            ctx.messages = resume.filtered_messages.clone();
            if let Some(resp) = apply_approval_resume(state, &mut ctx, resume).await? {
                return Ok(resp);
            }
            // The interaction is in history now; nothing new to forward.
            ctx.messages.retain(|m| m.role != Role::Tool);
        }
    }

    ctx.messages =
        prepare_messages_for_session(state, request, session_id, std::mem::take(&mut ctx.messages));

    if ctx.tool_names.is_empty() {
        return run_text_only(state, &mut ctx).await;
    }

    run_tool_iterations(state, &mut ctx).await
}

async fn run_text_only(state: &AppState, ctx: &mut LoopContext) -> Result<ResponseObject> {
    let result = state
        .invoker
        .invoke(
            &ctx.session_id,
            &ctx.messages,
            &[],
            false,
            ctx.instructions.as_deref(),
        )
        .await?;
    ctx.total_usage = ctx.total_usage.add(&result.usage());

    let LlmResult::Text { text, assistant, .. } = result else {
        return Err(Error::Server("tool call without tools bound".into()));
    };
    state
        .sessions
        .append_assistant(&ctx.session_id, &ctx.messages, assistant);

    Ok(ctx.response(
        vec![OutputItem::text_message(text, ItemStatus::Completed)],
        ResponseStatus::Completed,
        None,
    ))
}

async fn run_tool_iterations(state: &AppState, ctx: &mut LoopContext) -> Result<ResponseObject> {
    let max_iterations = state.config.agent.max_iterations;

    for iteration in 1..=max_iterations {
        let instructions = ctx.augmented_instructions(state);
        let result = state
            .invoker
            .invoke(
                &ctx.session_id,
                &ctx.messages,
                &ctx.tool_names,
                true,
                instructions.as_deref(),
            )
            .await?;
        ctx.total_usage = ctx.total_usage.add(&result.usage());

        match result {
            LlmResult::Text { text, assistant, .. } => {
                state
                    .sessions
                    .append_assistant(&ctx.session_id, &ctx.messages, assistant);
                return Ok(ctx.response(
                    vec![OutputItem::text_message(text, ItemStatus::Completed)],
                    ResponseStatus::Completed,
                    Some(iteration),
                ));
            }
            LlmResult::ToolCalls {
                calls, assistant, ..
            } => {
                if let Some(resp) =
                    handle_tool_calls(state, ctx, calls, assistant, Some(iteration)).await?
                {
                    return Ok(resp);
                }
                ctx.messages.clear();
            }
        }
    }

    Ok(ctx.response(
        vec![OutputItem::text_message(
            format!("Reached maximum iterations ({max_iterations})."),
            ItemStatus::Incomplete,
        )],
        ResponseStatus::Incomplete,
        Some(max_iterations),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-call iteration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle one tool-call iteration: classify, gate, execute, chain, defer.
/// Returns a terminal response when the turn must stop here.
async fn handle_tool_calls(
    state: &AppState,
    ctx: &mut LoopContext,
    all_calls: Vec<ToolCall>,
    assistant: Message,
    iteration: Option<u32>,
) -> Result<Option<ResponseObject>> {
    let (client_calls, server_calls): (Vec<ToolCall>, Vec<ToolCall>) = all_calls
        .iter()
        .cloned()
        .partition(|tc| state.catalog.is_client_side(&tc.name));

    // A server-side call nobody can execute (and that isn't merely gated)
    // is a hard failure.
    if let Some(unsupported) = server_calls.iter().find(|tc| {
        !state.tools.is_executable(&tc.name)
            && !state
                .approval
                .needs_approval(&state.catalog, &tc.name, &ctx.session_id)
    }) {
        return Err(Error::ToolNotImplemented(unsupported.name.clone()));
    }

    // Approval gate: park the whole server batch behind one question.
    if server_calls
        .iter()
        .any(|tc| state.approval.needs_approval(&state.catalog, &tc.name, &ctx.session_id))
    {
        let usage = assistant.usage;
        let (approval_call_id, question) = state.approval.request_approval(
            &state.catalog,
            &ctx.session_id,
            server_calls,
            ctx.messages.clone(),
            usage,
            Some(assistant),
            vec![],
        );
        return Ok(Some(ctx.response(
            vec![OutputItem::function_call(
                "ask_question",
                &question,
                approval_call_id,
            )],
            ResponseStatus::Incomplete,
            iteration,
        )));
    }

    // Execute all server-side calls in parallel.
    let mut tool_results = state.tools.execute_batch(&server_calls, &ctx.session_id).await;
    ctx.tool_call_count += tool_results.len() as u64;
    for (tc, result) in server_calls.iter().zip(tool_results.iter()) {
        ctx.output_items
            .push(OutputItem::function_call(&tc.name, &tc.args, &tc.id));
        ctx.output_items
            .push(OutputItem::function_call_output(&tc.id, &result.content));
    }

    // Client-side calls are tracked with their args JSON as placeholder
    // results; the client executes them and answers in a follow-up turn.
    for tc in &client_calls {
        tool_results.push(Message::tool_result(
            &tc.id,
            &tc.name,
            tc.args.to_string(),
        ));
    }

    state.sessions.append_tool_interaction(
        &ctx.session_id,
        &ctx.messages,
        assistant,
        &tool_results,
    );

    // Chain follow-ups from the executed server calls.
    let server_results: Vec<Message> = tool_results
        .iter()
        .take(server_calls.len())
        .cloned()
        .collect();
    let chained = state
        .chains
        .build(&server_calls, &server_results, Some(&ctx.session_id));
    if !chained.is_empty() {
        if let Some(resp) = handle_chained_calls(state, ctx, chained, iteration).await {
            return Ok(Some(resp));
        }
    }

    if !client_calls.is_empty() {
        let output = client_calls
            .iter()
            .map(|tc| OutputItem::function_call(&tc.name, &tc.args, &tc.id))
            .collect();
        return Ok(Some(ctx.response(output, ResponseStatus::Incomplete, iteration)));
    }

    Ok(None)
}

/// Execute or gate chained calls.  Returns an `incomplete` response when a
/// chained call needs approval.
async fn handle_chained_calls(
    state: &AppState,
    ctx: &mut LoopContext,
    chained: Vec<ToolCall>,
    iteration: Option<u32>,
) -> Option<ResponseObject> {
    let needs_gate = chained
        .iter()
        .any(|tc| state.approval.needs_approval(&state.catalog, &tc.name, &ctx.session_id));

    if needs_gate {
        // Gate the first unapproved call (plus anything auto-approved);
        // the rest stay queued behind the decision.
        let (mut unapproved, auto): (Vec<ToolCall>, Vec<ToolCall>) =
            chained.into_iter().partition(|tc| {
                state
                    .approval
                    .needs_approval(&state.catalog, &tc.name, &ctx.session_id)
            });
        let remaining = unapproved.split_off(1);
        let mut batch = unapproved;
        batch.extend(auto);

        let (approval_call_id, question) = state.approval.request_approval(
            &state.catalog,
            &ctx.session_id,
            batch,
            vec![],
            None,
            None,
            remaining,
        );
        return Some(ctx.response(
            vec![OutputItem::function_call(
                "ask_question",
                &question,
                approval_call_id,
            )],
            ResponseStatus::Incomplete,
            iteration,
        ));
    }

    let results = state.tools.execute_batch(&chained, &ctx.session_id).await;
    ctx.tool_call_count += results.len() as u64;
    for (tc, result) in chained.iter().zip(results.iter()) {
        ctx.output_items
            .push(OutputItem::function_call(&tc.name, &tc.args, &tc.id));
        ctx.output_items
            .push(OutputItem::function_call_output(&tc.id, &result.content));
    }
    state
        .sessions
        .append_chained_interaction(&ctx.session_id, &chained, &results);
    None
}

/// Apply a consumed approval answer: execute or deny the parked calls,
/// re-attribute the saved usage, then evaluate any queued chains.
async fn apply_approval_resume(
    state: &AppState,
    ctx: &mut LoopContext,
    resume: ApprovalResume,
) -> Result<Option<ResponseObject>> {
    let pending = resume.pending;

    if let Some(usage) = pending.saved_usage {
        ctx.total_usage = ctx.total_usage.add(&usage);
    }

    let tool_results = if resume.decision.allows_execution() {
        let results = state
            .tools
            .execute_batch(&pending.tool_calls, &ctx.session_id)
            .await;
        ctx.tool_call_count += results.len() as u64;
        for (tc, result) in pending.tool_calls.iter().zip(results.iter()) {
            ctx.output_items
                .push(OutputItem::function_call(&tc.name, &tc.args, &tc.id));
            ctx.output_items
                .push(OutputItem::function_call_output(&tc.id, &result.content));
        }
        results
    } else {
        pending
            .tool_calls
            .iter()
            .map(|tc| {
                Message::tool_result(
                    &tc.id,
                    &tc.name,
                    format!("Permission denied by user for tool: {}", tc.name),
                )
            })
            .collect()
    };

    let assistant = pending
        .saved_assistant
        .clone()
        .unwrap_or_else(|| Message::assistant_with_calls("", pending.tool_calls.clone()));
    state.sessions.append_tool_interaction(
        &ctx.session_id,
        &pending.saved_input_messages,
        assistant,
        &tool_results,
    );

    if !pending.remaining_chained.is_empty() {
        if let Some(resp) =
            handle_chained_calls(state, ctx, pending.remaining_chained.clone(), None).await
        {
            return Ok(Some(resp));
        }
    }

    let chained = state
        .chains
        .build(&pending.tool_calls, &tool_results, Some(&ctx.session_id));
    if !chained.is_empty() {
        if let Some(resp) = handle_chained_calls(state, ctx, chained, None).await {
            return Ok(Some(resp));
        }
    }

    Ok(None)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Headless entry (scheduler)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run a synthetic turn with no user present.  The prompt and outputs are
/// persisted so the user can audit the headless run later.
pub async fn run_headless_turn(
    state: &AppState,
    session_id: &str,
    prompt: String,
) -> Result<ResponseObject> {
    let mut metadata = serde_json::Map::new();
    metadata.insert("session_id".into(), serde_json::json!(session_id));

    let request = ResponseRequest {
        model: None,
        input: InputPayload::Text(prompt.clone()),
        tools: None,
        previous_response_id: None,
        instructions: Some(HEADLESS_INSTRUCTIONS.to_string()),
        temperature: None,
        max_output_tokens: None,
        stream: false,
        metadata: Some(metadata),
        tool_choice: None,
        truncation: None,
    };

    let session_id = state.sessions.get_or_create(Some(session_id));
    let response_id = state
        .persist
        .begin_response(&session_id, &state.config.llm.model);
    state
        .persist
        .persist_input(&session_id, &response_id, &request.input);

    let response = run_turn(state, &request).await;
    state
        .persist
        .persist_output(&response, &session_id, &response_id, &state.sessions);

    if response.status == ResponseStatus::Failed {
        let message = response
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "headless turn failed".into());
        return Err(Error::Server(message));
    }
    Ok(response)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming entry (SSE mirror)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run the turn while emitting SSE event payloads into `tx`.  The state
/// machine decisions are identical to [`run_turn`]; only the emission
/// differs.  The caller appends the `[DONE]` terminator.
pub async fn stream_turn(state: AppState, request: ResponseRequest, tx: mpsc::Sender<Value>) {
    let created_at = Utc::now().timestamp();
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.config.llm.model.clone());

    for evicted in state.sessions.evict() {
        state.clear_session_state(&evicted);
    }
    let session_id = state.sessions.get_or_create(request.session_id());

    let response_id = format!("resp_{}", uuid::Uuid::new_v4().simple());
    let _ = tx
        .send(serde_json::json!({
            "type": "response.created",
            "response": {
                "id": response_id,
                "status": "in_progress",
                "model": model,
                "created_at": created_at,
                "metadata": { "session_id": session_id },
            },
        }))
        .await;

    if let Err(e) =
        stream_turn_inner(&state, &request, &session_id, created_at, &model, &tx).await
    {
        tracing::error!(%session_id, error = %e, "streaming turn failed");
        let failed = build_response(
            vec![],
            ResponseStatus::Failed,
            &session_id,
            created_at,
            &model,
            Usage::zero(),
            Some(ErrorObject::server_error(e.to_string())),
            None,
            None,
            &[],
        );
        let _ = tx
            .send(serde_json::json!({
                "type": "response.failed",
                "response": failed,
            }))
            .await;
    }
}

async fn stream_turn_inner(
    state: &AppState,
    request: &ResponseRequest,
    session_id: &str,
    created_at: i64,
    model: &str,
    tx: &mpsc::Sender<Value>,
) -> Result<()> {
    let messages = parse_input(request);
    if messages.is_empty() && parse_tool_call_echoes(request).is_none() {
        return Err(Error::InvalidRequest("No input messages".into()));
    }

    let mut ctx = LoopContext {
        session_id: session_id.to_string(),
        created_at,
        model: model.to_string(),
        instructions: request.instructions.clone(),
        messages,
        tool_names: resolve_tool_names(state, request),
        total_usage: Usage::zero(),
        tool_call_count: 0,
        output_items: Vec::new(),
    };

    let lock = state.sessions.loop_lock(session_id);
    let _guard = lock.lock().await;

    if state.approval.has_pending(session_id) {
        if let Some(resume) = state
            .approval
            .handle_response(session_id, &ctx.messages.clone())
        {
            ctx.messages = resume.filtered_messages.clone();
            if let Some(resp) = apply_approval_resume(state, &mut ctx, resume).await? {
                send_terminal(tx, resp).await;
                return Ok(());
            }
            ctx.messages.retain(|m| m.role != Role::Tool);
        }
    }

    ctx.messages =
        prepare_messages_for_session(state, request, session_id, std::mem::take(&mut ctx.messages));

    let max_iterations = state.config.agent.max_iterations;

    for iteration in 1..=max_iterations {
        let instructions = ctx.augmented_instructions(state);
        let use_tools = !ctx.tool_names.is_empty();

        let mut stream = state
            .invoker
            .invoke_stream(
                &ctx.session_id,
                &ctx.messages,
                &ctx.tool_names,
                use_tools,
                instructions.as_deref(),
            )
            .await?;

        let mut text_buf = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        let mut usage = Usage::zero();
        let mut provider_raw: Option<Value> = None;

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Token { text } => {
                    text_buf.push_str(&text);
                    let _ = tx
                        .send(serde_json::json!({
                            "type": "response.output_text.delta",
                            "delta": text,
                        }))
                        .await;
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    calls.push(ToolCall {
                        id: call_id,
                        name: tool_name,
                        args: arguments,
                    });
                }
                StreamEvent::Done {
                    usage: u,
                    provider_raw: raw,
                    ..
                } => {
                    if let Some(u) = u {
                        usage = u;
                    }
                    if raw.is_some() {
                        provider_raw = raw;
                    }
                }
                StreamEvent::Error { message } => {
                    return Err(Error::ProviderFatal(message));
                }
                StreamEvent::ToolCallStarted { .. } | StreamEvent::ToolCallDelta { .. } => {}
            }
        }

        ctx.total_usage = ctx.total_usage.add(&usage);

        let mut assistant = Message::assistant(text_buf.clone());
        assistant.usage = Some(usage);
        assistant.provider_raw = provider_raw;

        if calls.is_empty() {
            state
                .sessions
                .append_assistant(&ctx.session_id, &ctx.messages, assistant);
            let _ = tx
                .send(serde_json::json!({
                    "type": "response.output_text.done",
                    "text": text_buf,
                    "usage": usage,
                }))
                .await;
            let resp = ctx.response(
                vec![OutputItem::text_message(text_buf, ItemStatus::Completed)],
                ResponseStatus::Completed,
                Some(iteration),
            );
            send_terminal(tx, resp).await;
            return Ok(());
        }

        // Tool calls decided by the model — usage attributed per iteration.
        assistant.tool_calls = Some(calls.clone());
        for tc in &calls {
            let _ = tx
                .send(serde_json::json!({
                    "type": "response.function_call.done",
                    "item": {
                        "call_id": tc.id,
                        "name": tc.name,
                        "arguments": tc.args.to_string(),
                    },
                    "usage": usage,
                }))
                .await;
        }

        let items_before = ctx.output_items.len();
        let outcome = handle_tool_calls(state, &mut ctx, calls, assistant, Some(iteration)).await?;

        // Server-side results produced this iteration.
        for item in &ctx.output_items[items_before..] {
            if let OutputItem::FunctionCallOutput { call_id, output, .. } = item {
                let _ = tx
                    .send(serde_json::json!({
                        "type": "response.tool_result.done",
                        "call_id": call_id,
                        "output": output,
                        "status": "completed",
                    }))
                    .await;
            }
        }

        if let Some(todo) = state.todo.get_state(&ctx.session_id) {
            let _ = tx
                .send(serde_json::json!({
                    "type": "response.todo.updated",
                    "todo": {
                        "task": todo.task,
                        "steps": todo.steps,
                    },
                }))
                .await;
        }

        if let Some(resp) = outcome {
            send_terminal(tx, resp).await;
            return Ok(());
        }

        ctx.messages.clear();
    }

    let resp = ctx.response(
        vec![OutputItem::text_message(
            format!("Reached maximum iterations ({max_iterations})."),
            ItemStatus::Incomplete,
        )],
        ResponseStatus::Incomplete,
        Some(max_iterations),
    );
    send_terminal(tx, resp).await;
    Ok(())
}

async fn send_terminal(tx: &mpsc::Sender<Value>, resp: ResponseObject) {
    let event = match resp.status {
        ResponseStatus::Completed => "response.completed",
        ResponseStatus::Failed => "response.failed",
        _ => "response.incomplete",
    };
    let _ = tx
        .send(serde_json::json!({ "type": event, "response": resp }))
        .await;
}
