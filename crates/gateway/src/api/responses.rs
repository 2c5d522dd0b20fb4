//! `POST /v1/responses` — the turn endpoint, non-streaming and SSE.
//!
//! The handler persists new input items, runs the turn, persists the
//! output, and injects cost fields into every usage payload it forwards.
//! For streams, a detached collector performs the final persistence even
//! if the client goes away mid-turn.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use serde_json::Value;
use tokio::sync::mpsc;

use cadence_domain::config::ModelPricing;
use cadence_domain::responses::{ResponseObject, ResponseRequest};

use crate::runtime::turn::{run_turn, stream_turn};
use crate::state::AppState;

pub async fn create_response(
    State(state): State<AppState>,
    Json(mut request): Json<ResponseRequest>,
) -> impl IntoResponse {
    // Discovery is TTL-cached; this is a no-op most requests.
    state.refresh_external_tools().await;

    let model = request
        .model
        .clone()
        .unwrap_or_else(|| state.config.llm.model.clone());
    let session_id = state.sessions.get_or_create(request.session_id());

    // The runner must see the same session id the store uses — without
    // this, a fresh conversation would mint divergent ids and break the
    // internal endpoints that look up sessions.
    let metadata = request.metadata.get_or_insert_with(Default::default);
    metadata.insert("session_id".into(), serde_json::json!(session_id));

    let response_id = state.persist.begin_response(&session_id, &model);
    state
        .persist
        .persist_input(&session_id, &response_id, &request.input);

    let pricing = state.config.llm.pricing.get(&model).copied();

    if request.stream {
        return stream_response(state, request, session_id, response_id, pricing)
            .into_response();
    }

    let response = run_turn(&state, &request).await;
    let (input_cost, output_cost, total_cost) =
        state
            .persist
            .persist_output(&response, &session_id, &response_id, &state.sessions);

    let mut body = serde_json::to_value(&response).unwrap_or_default();
    if let Some(usage) = body.get_mut("usage") {
        usage["input_cost"] = serde_json::json!(input_cost);
        usage["output_cost"] = serde_json::json!(output_cost);
        usage["total_cost"] = serde_json::json!(total_cost);
    }
    Json(body).into_response()
}

fn stream_response(
    state: AppState,
    request: ResponseRequest,
    session_id: String,
    response_id: String,
    pricing: Option<ModelPricing>,
) -> impl IntoResponse {
    let (turn_tx, mut turn_rx) = mpsc::channel::<Value>(64);
    let (client_tx, mut client_rx) = mpsc::channel::<Value>(64);

    tokio::spawn(stream_turn(state.clone(), request, turn_tx));

    // Detached collector: forwards events to the client and performs the
    // final persistence.  A cancelled client closes client_tx receivers
    // but the turn — and its persistence — still completes.
    tokio::spawn(async move {
        while let Some(mut event) = turn_rx.recv().await {
            inject_cost(&mut event, pricing.as_ref());

            let terminal = matches!(
                event.get("type").and_then(|t| t.as_str()),
                Some("response.completed") | Some("response.incomplete") | Some("response.failed")
            );
            if terminal {
                if let Some(resp_value) = event.get("response") {
                    match serde_json::from_value::<ResponseObject>(resp_value.clone()) {
                        Ok(resp) => {
                            state.persist.persist_output(
                                &resp,
                                &session_id,
                                &response_id,
                                &state.sessions,
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to decode terminal response");
                            state.persist.mark_failed(&response_id);
                        }
                    }
                }
            }

            let _ = client_tx.send(event).await;
        }
    });

    let stream = async_stream::stream! {
        while let Some(event) = client_rx.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok::<_, std::convert::Infallible>(Event::default().data(data));
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Add cost fields to any usage object in an event payload.
fn inject_cost(event: &mut Value, pricing: Option<&ModelPricing>) {
    let Some(pricing) = pricing else {
        return;
    };

    fn apply(usage: &mut Value, pricing: &ModelPricing) {
        let input = usage
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let output = usage
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let input_cost = input as f64 * pricing.input_cost_per_mtok / 1_000_000.0;
        let output_cost = output as f64 * pricing.output_cost_per_mtok / 1_000_000.0;
        usage["input_cost"] = serde_json::json!(input_cost);
        usage["output_cost"] = serde_json::json!(output_cost);
        usage["total_cost"] = serde_json::json!(input_cost + output_cost);
    }

    if let Some(usage) = event.get_mut("usage") {
        apply(usage, pricing);
    }
    if let Some(usage) = event
        .get_mut("response")
        .and_then(|r| r.get_mut("usage"))
    {
        apply(usage, pricing);
    }
}
