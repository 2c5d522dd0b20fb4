//! End-to-end turns through the full runtime with a scripted provider.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use cadence_domain::config::Config;
use cadence_domain::error::{Error, Result};
use cadence_domain::message::{Role, ToolCall, Usage};
use cadence_domain::responses::{OutputItem, ResponseRequest, ResponseStatus};
use cadence_domain::stream::{BoxStream, StreamEvent};
use cadence_gateway::runtime::tools_exec::ToolHandler;
use cadence_gateway::runtime::turn::{run_turn, stream_turn};
use cadence_gateway::state::AppState;
use cadence_providers::{ChatRequest, ChatResponse, LlmProvider};
use cadence_tools::ToolDescriptor;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ScriptedProvider {
    chats: Mutex<Vec<Result<ChatResponse>>>,
    streams: Mutex<Vec<Vec<StreamEvent>>>,
}

impl ScriptedProvider {
    fn new(chats: Vec<Result<ChatResponse>>) -> Arc<Self> {
        Arc::new(Self {
            chats: Mutex::new(chats),
            streams: Mutex::new(Vec::new()),
        })
    }

    fn with_streams(streams: Vec<Vec<StreamEvent>>) -> Arc<Self> {
        Arc::new(Self {
            chats: Mutex::new(Vec::new()),
            streams: Mutex::new(streams),
        })
    }

    fn text(content: &str, input: u64, output: u64) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            tool_calls: vec![],
            usage: Some(Usage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: input + output,
                ..Default::default()
            }),
            model: "mock".into(),
            finish_reason: Some("stop".into()),
            provider_raw: Some(json!({"role": "assistant", "sig": "opaque"})),
        }
    }

    fn tool_calls(calls: Vec<(&str, &str, Value)>) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            tool_calls: calls
                .into_iter()
                .map(|(id, name, args)| ToolCall {
                    id: id.into(),
                    name: name.into(),
                    args,
                })
                .collect(),
            usage: Some(Usage {
                input_tokens: 20,
                output_tokens: 10,
                total_tokens: 30,
                ..Default::default()
            }),
            model: "mock".into(),
            finish_reason: Some("tool_calls".into()),
            provider_raw: Some(json!({"role": "assistant", "sig": "tool-sig"})),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        let mut chats = self.chats.lock();
        if chats.is_empty() {
            return Err(Error::ProviderFatal("script exhausted".into()));
        }
        chats.remove(0)
    }

    async fn chat_stream(
        &self,
        _req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let mut streams = self.streams.lock();
        if streams.is_empty() {
            return Err(Error::ProviderFatal("stream script exhausted".into()));
        }
        let events = streams.remove(0);
        Ok(Box::pin(futures_util::stream::iter(
            events.into_iter().map(Ok),
        )))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

/// A bash executor scripted by command.
struct ScriptedBash;

#[async_trait::async_trait]
impl ToolHandler for ScriptedBash {
    async fn execute(&self, _name: &str, args: &Value, _session_id: &str) -> Result<String> {
        match args.get("command").and_then(|c| c.as_str()) {
            Some("ls") => Ok("a\nb".into()),
            Some("pwd") => Ok("/home".into()),
            other => Ok(format!("unknown command: {other:?}")),
        }
    }
}

struct FixedResult(&'static str);

#[async_trait::async_trait]
impl ToolHandler for FixedResult {
    async fn execute(&self, _name: &str, _args: &Value, _session_id: &str) -> Result<String> {
        Ok(self.0.to_string())
    }
}

fn test_state(provider: Arc<ScriptedProvider>) -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.server.state_path = dir.path().to_path_buf();
    config.scheduler.retry_base_delay_secs = 0;
    let state = AppState::build_with_provider(config, provider).unwrap();
    (state, dir)
}

fn request(input: Value, session_id: &str) -> ResponseRequest {
    serde_json::from_value(json!({
        "input": input,
        "metadata": {"session_id": session_id},
    }))
    .unwrap()
}

fn request_with_tools(input: Value, session_id: &str, tools: &[&str]) -> ResponseRequest {
    let tool_defs: Vec<Value> = tools
        .iter()
        .map(|name| json!({"type": "function", "function": {"name": name, "parameters": {}}}))
        .collect();
    serde_json::from_value(json!({
        "input": input,
        "tools": tool_defs,
        "metadata": {"session_id": session_id},
    }))
    .unwrap()
}

fn function_calls(resp: &cadence_domain::responses::ResponseObject) -> Vec<(&str, &str)> {
    resp.output
        .iter()
        .filter_map(|item| match item {
            OutputItem::FunctionCall { name, call_id, .. } => {
                Some((name.as_str(), call_id.as_str()))
            }
            _ => None,
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// E1 — text only
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn text_only_turn_completes() {
    let provider = ScriptedProvider::new(vec![Ok(ScriptedProvider::text("Hello!", 10, 5))]);
    let (state, _dir) = test_state(provider);

    let resp = run_turn(&state, &request(json!("Hi"), "e1")).await;

    assert_eq!(resp.status, ResponseStatus::Completed);
    assert_eq!(resp.output_text(), "Hello!");
    assert_eq!(resp.usage.input_tokens, 10);
    assert_eq!(resp.usage.output_tokens, 5);
    assert_eq!(resp.usage.total_tokens, 15);

    let history = state.sessions.history("e1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "Hello!");
    // The fresh assistant keeps its raw provider metadata.
    assert!(history[1].provider_raw.is_some());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// E2 — parallel tool calls, no approval
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn parallel_tool_calls_complete_in_one_turn() {
    let provider = ScriptedProvider::new(vec![
        Ok(ScriptedProvider::tool_calls(vec![
            ("c1", "bash", json!({"command": "ls"})),
            ("c2", "bash", json!({"command": "pwd"})),
        ])),
        Ok(ScriptedProvider::text("done", 15, 3)),
    ]);
    let (state, _dir) = test_state(provider);

    // This deployment executes bash server-side.
    state.catalog.upsert_builtin(ToolDescriptor::server(
        "bash",
        "Run a shell command.",
        json!({"type": "object", "properties": {"command": {"type": "string"}}}),
    ));
    state.tools.register_handler("bash", Arc::new(ScriptedBash));

    let resp = run_turn(&state, &request_with_tools(json!("list files"), "e2", &["bash"])).await;

    assert_eq!(resp.status, ResponseStatus::Completed);
    assert_eq!(resp.output_text(), "done");
    assert_eq!(resp.metadata["iterations"], 2);
    assert_eq!(resp.metadata["tool_call_count"], 2);

    // tool_history: two function_call + two function_call_output in order.
    let history_items = resp.metadata["tool_history"].as_array().unwrap();
    let kinds: Vec<&str> = history_items
        .iter()
        .map(|i| i["type"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "function_call",
            "function_call_output",
            "function_call",
            "function_call_output"
        ]
    );
    assert_eq!(history_items[1]["output"], "a\nb");
    assert_eq!(history_items[3]["output"], "/home");

    // Session history: user, assistant with both calls, both tool results,
    // final assistant.
    let history = state.sessions.history("e2");
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].tool_calls.as_ref().unwrap().len(), 2);
    assert_eq!(history[2].content, "a\nb");
    assert_eq!(history[3].content, "/home");
    assert_eq!(history[4].content, "done");

    // I1: every tool message correlates to a prior assistant call.
    let known: Vec<&str> = history[1]
        .tool_calls
        .as_ref()
        .unwrap()
        .iter()
        .map(|tc| tc.id.as_str())
        .collect();
    for msg in history.iter().filter(|m| m.role == Role::Tool) {
        assert!(known.contains(&msg.tool_call_id.as_deref().unwrap()));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// E3 — approval required, then Always Allow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn approval_gate_parks_and_resumes() {
    let provider = ScriptedProvider::new(vec![
        Ok(ScriptedProvider::tool_calls(vec![(
            "cs",
            "web_search",
            json!({"query": "q"}),
        )])),
        Ok(ScriptedProvider::text("Here you go", 25, 8)),
    ]);
    let (state, _dir) = test_state(provider);
    state.catalog.mark_approval_required("web_search");
    state
        .tools
        .register_handler("web_search", Arc::new(FixedResult("results")));

    // Turn 1: the call is gated.
    let resp = run_turn(&state, &request(json!("search for q"), "e3")).await;
    assert_eq!(resp.status, ResponseStatus::Incomplete);
    let calls = function_calls(&resp);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "ask_question");
    let approval_id = calls[0].1.to_string();

    let OutputItem::FunctionCall { arguments, .. } = &resp.output[0] else {
        panic!("expected function call output");
    };
    let args: Value = serde_json::from_str(arguments).unwrap();
    assert_eq!(args["question"], "Allow web_search({\"query\":\"q\"})?");
    assert_eq!(args["choices"], json!(["Allow Once", "Always Allow", "Deny"]));
    assert!(state.approval.has_pending("e3"));

    // Turn 2: the answer arrives.
    let resume = request(
        json!([{
            "type": "function_call_output",
            "call_id": approval_id,
            "output": "Always Allow",
        }]),
        "e3",
    );
    let resp = run_turn(&state, &resume).await;

    assert_eq!(resp.status, ResponseStatus::Completed);
    assert_eq!(resp.output_text(), "Here you go");
    assert!(state.approval.auto_approved("e3").contains("web_search"));
    assert!(!state.approval.has_pending("e3"));

    // The gated call actually executed.
    let history = state.sessions.history("e3");
    assert!(history
        .iter()
        .any(|m| m.role == Role::Tool && m.content == "results"));
    // I2: last message is an assistant.
    assert_eq!(history.last().unwrap().role, Role::Assistant);
}

#[tokio::test]
async fn approval_denial_synthesizes_denied_results() {
    let provider = ScriptedProvider::new(vec![
        Ok(ScriptedProvider::tool_calls(vec![(
            "cs",
            "web_search",
            json!({"query": "q"}),
        )])),
        Ok(ScriptedProvider::text("understood", 5, 2)),
    ]);
    let (state, _dir) = test_state(provider);
    state.catalog.mark_approval_required("web_search");
    state
        .tools
        .register_handler("web_search", Arc::new(FixedResult("results")));

    let resp = run_turn(&state, &request(json!("search"), "e3d")).await;
    let approval_id = function_calls(&resp)[0].1.to_string();

    let resume = request(
        json!([{
            "type": "function_call_output",
            "call_id": approval_id,
            "output": "User chose: Deny",
        }]),
        "e3d",
    );
    let resp = run_turn(&state, &resume).await;
    assert_eq!(resp.status, ResponseStatus::Completed);

    let history = state.sessions.history("e3d");
    assert!(history.iter().any(|m| {
        m.role == Role::Tool && m.content == "Permission denied by user for tool: web_search"
    }));
    assert!(state.approval.auto_approved("e3d").is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// E4 — overflow recovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn overflow_recovers_via_compaction() {
    let provider = ScriptedProvider::new(vec![
        Err(Error::ProviderFatal(
            "400: maximum context length exceeded (context_length_exceeded)".into(),
        )),
        Ok(ScriptedProvider::text("## Goal\nsummarized", 5, 5)), // summarizer
        Ok(ScriptedProvider::text("recovered", 30, 4)),
    ]);
    let (state, _dir) = test_state(provider);

    // A long session: enough assistants that compaction has a prefix to
    // remove beyond the protected tail.
    let sid = state.sessions.get_or_create(Some("e4"));
    for i in 0..6 {
        state.sessions.append_assistant(
            &sid,
            &[cadence_domain::message::Message::user(format!("q{i}"))],
            cadence_domain::message::Message::assistant(format!("a{i}")),
        );
    }

    let resp = run_turn(&state, &request(json!("continue"), "e4")).await;

    assert_eq!(resp.status, ResponseStatus::Completed);
    assert_eq!(resp.output_text(), "recovered");
    assert_eq!(resp.usage.total_tokens, 34);

    let history = state.sessions.history("e4");
    // I3: exactly one compaction summary.
    assert_eq!(
        history.iter().filter(|m| m.is_compaction_summary()).count(),
        1
    );
    assert_eq!(history.last().unwrap().content, "recovered");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// E5 — client-side tool deferral
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn client_side_call_is_deferred() {
    let provider = ScriptedProvider::new(vec![Ok(ScriptedProvider::tool_calls(vec![(
        "c1",
        "browser_navigate",
        json!({"url": "https://x"}),
    )]))]);
    let (state, _dir) = test_state(provider);

    let resp = run_turn(&state, &request(json!("open x"), "e5")).await;

    assert_eq!(resp.status, ResponseStatus::Incomplete);
    let calls = function_calls(&resp);
    assert_eq!(calls, vec![("browser_navigate", "c1")]);

    // History tracks the deferral with the args JSON as placeholder.
    let history = state.sessions.history("e5");
    assert_eq!(history.len(), 3);
    assert!(history[1].has_tool_calls());
    assert_eq!(history[2].role, Role::Tool);
    assert_eq!(history[2].content, "{\"url\":\"https://x\"}");
}

#[tokio::test]
async fn client_result_finalizes_placeholder_next_turn() {
    let provider = ScriptedProvider::new(vec![
        Ok(ScriptedProvider::tool_calls(vec![(
            "c1",
            "browser_navigate",
            json!({"url": "https://x"}),
        )])),
        Ok(ScriptedProvider::text("The page says hi", 12, 6)),
    ]);
    let (state, _dir) = test_state(provider);

    run_turn(&state, &request(json!("open x"), "e5b")).await;

    // The client executed the call and sends the real output back.
    let followup = request(
        json!([{
            "type": "function_call_output",
            "call_id": "c1",
            "output": "Page: \"X\" URL: https://x",
        }]),
        "e5b",
    );
    let resp = run_turn(&state, &followup).await;
    assert_eq!(resp.status, ResponseStatus::Completed);

    // I5: the placeholder was replaced in place.
    let history = state.sessions.history("e5b");
    let tool_msg = history
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("c1"))
        .unwrap();
    assert_eq!(tool_msg.content, "Page: \"X\" URL: https://x");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chains
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn chain_rule_queues_follow_up_call() {
    let provider = ScriptedProvider::new(vec![
        Ok(ScriptedProvider::tool_calls(vec![(
            "c1",
            "web_search",
            json!({"query": "rust"}),
        )])),
        Ok(ScriptedProvider::text("summary of results", 8, 4)),
    ]);
    let (state, _dir) = test_state(provider);
    state.tools.register_handler(
        "web_search",
        Arc::new(FixedResult(r#"{"results": [{"url": "https://a"}]}"#)),
    );
    state
        .tools
        .register_handler("web_fetch", Arc::new(FixedResult("page body")));
    state.chains.register(cadence_tools::ChainRule {
        source: "web_search".into(),
        steps: vec![cadence_tools::ChainStep {
            target: "web_fetch".into(),
            extract: "results[*].url".into(),
            arg_mapping: std::collections::HashMap::from([(
                "url".to_string(),
                "$value".to_string(),
            )]),
        }],
    });

    let resp = run_turn(&state, &request(json!("search rust"), "chain1")).await;
    assert_eq!(resp.status, ResponseStatus::Completed);

    // The chained web_fetch executed and its result is in history.
    let history = state.sessions.history("chain1");
    assert!(history
        .iter()
        .any(|m| m.role == Role::Tool && m.content == "page body"));
    assert_eq!(resp.metadata["tool_call_count"], 2);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Echo recovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn echo_recovery_rebuilds_assistant_turn() {
    let provider = ScriptedProvider::new(vec![Ok(ScriptedProvider::text("got it", 9, 3))]);
    let (state, _dir) = test_state(provider);

    // Fresh session, but the client replays the prior tool round-trip.
    let req = request(
        json!([
            {"type": "message", "role": "user", "content": "run ls"},
            {"type": "function_call", "call_id": "c1", "name": "bash",
             "arguments": "{\"command\":\"ls\"}"},
            {"type": "function_call_output", "call_id": "c1", "output": "a\nb"}
        ]),
        "echo1",
    );
    let resp = run_turn(&state, &req).await;
    assert_eq!(resp.status, ResponseStatus::Completed);

    // The wire prompt saw [user, assistant{tool_calls}, tool, ...].
    let history = state.sessions.history("echo1");
    let user_idx = history.iter().position(|m| m.role == Role::User).unwrap();
    let asst_idx = history.iter().position(|m| m.has_tool_calls()).unwrap();
    let tool_idx = history.iter().position(|m| m.role == Role::Tool).unwrap();
    assert!(user_idx < asst_idx && asst_idx < tool_idx);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unknown server tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn unknown_server_tool_fails_turn() {
    let provider = ScriptedProvider::new(vec![Ok(ScriptedProvider::tool_calls(vec![(
        "c1",
        "quantum_flux",
        json!({}),
    )]))]);
    let (state, _dir) = test_state(provider);

    let resp = run_turn(&state, &request(json!("do the thing"), "notimpl")).await;
    assert_eq!(resp.status, ResponseStatus::Failed);
    let error = resp.error.unwrap();
    assert_eq!(error.code.as_deref(), Some("tool_not_implemented"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Iteration cap
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn iteration_cap_returns_incomplete() {
    // The model keeps asking for tools forever.
    let chats: Vec<Result<ChatResponse>> = (0..10)
        .map(|i| {
            Ok(ScriptedProvider::tool_calls(vec![(
                Box::leak(format!("c{i}").into_boxed_str()) as &str,
                "ping",
                json!({}),
            )]))
        })
        .collect();
    let provider = ScriptedProvider::new(chats);

    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.server.state_path = dir.path().to_path_buf();
    config.agent.max_iterations = 3;
    let state = AppState::build_with_provider(config, provider).unwrap();
    state
        .tools
        .register_handler("ping", Arc::new(FixedResult("pong")));

    let resp = run_turn(&state, &request(json!("loop forever"), "cap")).await;
    assert_eq!(resp.status, ResponseStatus::Incomplete);
    assert_eq!(resp.metadata["iterations"], 3);
    assert!(resp.output_text().contains("Reached maximum iterations (3)"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming mirror
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn streaming_emits_deltas_and_terminal() {
    let provider = ScriptedProvider::with_streams(vec![vec![
        StreamEvent::Token { text: "Hel".into() },
        StreamEvent::Token { text: "lo!".into() },
        StreamEvent::Done {
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                ..Default::default()
            }),
            finish_reason: Some("stop".into()),
            provider_raw: None,
        },
    ]]);
    let (state, _dir) = test_state(provider);

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    stream_turn(state.clone(), request(json!("Hi"), "sse1"), tx).await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let types: Vec<&str> = events
        .iter()
        .map(|e| e["type"].as_str().unwrap())
        .collect();
    assert_eq!(
        types,
        vec![
            "response.created",
            "response.output_text.delta",
            "response.output_text.delta",
            "response.output_text.done",
            "response.completed"
        ]
    );
    assert_eq!(events[1]["delta"], "Hel");
    assert_eq!(events[3]["text"], "Hello!");
    // I10: terminal usage equals the per-iteration sum.
    assert_eq!(events[4]["response"]["usage"]["total_tokens"], 15);

    let history = state.sessions.history("sse1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "Hello!");
}

#[tokio::test]
async fn streaming_tool_iteration_emits_call_and_result() {
    let provider = ScriptedProvider::with_streams(vec![
        vec![
            StreamEvent::ToolCallStarted {
                call_id: "c1".into(),
                tool_name: "ping".into(),
            },
            StreamEvent::ToolCallFinished {
                call_id: "c1".into(),
                tool_name: "ping".into(),
                arguments: json!({}),
            },
            StreamEvent::Done {
                usage: Some(Usage {
                    input_tokens: 7,
                    output_tokens: 2,
                    total_tokens: 9,
                    ..Default::default()
                }),
                finish_reason: Some("tool_calls".into()),
                provider_raw: None,
            },
        ],
        vec![
            StreamEvent::Token {
                text: "done".into(),
            },
            StreamEvent::Done {
                usage: Some(Usage {
                    input_tokens: 11,
                    output_tokens: 1,
                    total_tokens: 12,
                    ..Default::default()
                }),
                finish_reason: Some("stop".into()),
                provider_raw: None,
            },
        ],
    ]);
    let (state, _dir) = test_state(provider);
    state
        .tools
        .register_handler("ping", Arc::new(FixedResult("pong")));

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    stream_turn(state.clone(), request(json!("ping it"), "sse2"), tx).await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let types: Vec<&str> = events
        .iter()
        .map(|e| e["type"].as_str().unwrap())
        .collect();

    assert!(types.contains(&"response.function_call.done"));
    assert!(types.contains(&"response.tool_result.done"));
    assert_eq!(*types.last().unwrap(), "response.completed");

    let fc = events
        .iter()
        .find(|e| e["type"] == "response.function_call.done")
        .unwrap();
    assert_eq!(fc["item"]["call_id"], "c1");
    // Usage attributed per iteration.
    assert_eq!(fc["usage"]["total_tokens"], 9);

    let result = events
        .iter()
        .find(|e| e["type"] == "response.tool_result.done")
        .unwrap();
    assert_eq!(result["output"], "pong");

    // I10: total = 9 + 12.
    let terminal = events.last().unwrap();
    assert_eq!(terminal["response"]["usage"]["total_tokens"], 21);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Eviction drops per-session runtime state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn evicted_session_loses_approval_and_todo_state() {
    let provider = ScriptedProvider::new(vec![
        Ok(ScriptedProvider::tool_calls(vec![(
            "cs",
            "web_search",
            json!({"query": "q"}),
        )])),
        Ok(ScriptedProvider::text("ok", 5, 2)),
        Ok(ScriptedProvider::text("ok", 5, 2)),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.server.state_path = dir.path().to_path_buf();
    config.agent.max_sessions = 1;
    let state = AppState::build_with_provider(config, provider).unwrap();
    state.catalog.mark_approval_required("web_search");
    state
        .tools
        .register_handler("web_search", Arc::new(FixedResult("results")));

    // Session A parks an approval and has a TODO plan.
    let resp = run_turn(&state, &request(json!("search"), "ev-a")).await;
    assert_eq!(resp.status, ResponseStatus::Incomplete);
    state.todo.execute(
        &json!({"action": "create", "task": "t", "steps": ["a"]}),
        "ev-a",
    );
    assert!(state.approval.has_pending("ev-a"));

    // Two more sessions push A over the LRU cap; the third turn's
    // entry-time eviction must clear A's runtime state with it.
    run_turn(&state, &request(json!("Hi"), "ev-b")).await;
    run_turn(&state, &request(json!("Hi"), "ev-c")).await;

    assert!(!state.sessions.exists("ev-a"));
    assert!(!state.approval.has_pending("ev-a"));
    assert!(state.todo.get_state("ev-a").is_none());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction idempotence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn compaction_twice_is_idempotent() {
    let provider = ScriptedProvider::new(vec![
        Ok(ScriptedProvider::text("summary one", 5, 5)),
        Ok(ScriptedProvider::text("summary two", 5, 5)),
    ]);
    let (state, _dir) = test_state(provider);

    let sid = state.sessions.get_or_create(Some("idem"));
    for i in 0..6 {
        state.sessions.append_assistant(
            &sid,
            &[cadence_domain::message::Message::user(format!("q{i}"))],
            cadence_domain::message::Message::assistant(format!("a{i}")),
        );
    }

    state.invoker.compact_session(&sid).await;
    let first = state.sessions.history(&sid);

    state.invoker.compact_session(&sid).await;
    let second = state.sessions.history(&sid);

    // No intervening turn: the protected tail has nothing left to remove,
    // so the structure is stable and there is still exactly one summary.
    assert_eq!(first.len(), second.len());
    assert_eq!(
        second.iter().filter(|m| m.is_compaction_summary()).count(),
        1
    );
}
