//! LLM invoker with recovery.
//!
//! One logical LLM call, wrapped in the full recovery ladder:
//! proactive compaction → overflow compaction loop → one-shot aggressive
//! truncation → transient-error backoff → no-tools fallback →
//! clean-context fallback → propagate.
//!
//! Thought-signature validation errors skip backoff entirely: the replayed
//! metadata is what the provider rejects, so only the clean-context
//! fallback can help.

use std::sync::Arc;

use cadence_context::{
    compact_history, estimate_messages_tokens, prune_context_messages,
    truncate_oversized_tool_results,
};
use cadence_domain::config::{AgentConfig, CompactionConfig};
use cadence_domain::error::{
    is_overflow_message, is_retryable_message, is_thought_signature_message, Error, Result,
};
use cadence_domain::message::{LlmResult, Message, Role};
use cadence_domain::stream::{BoxStream, StreamEvent};
use cadence_providers::{ChatRequest, LlmProvider};
use cadence_sessions::SessionStore;
use cadence_tools::ToolCatalog;

use crate::prompts::build_system_prompt;

pub struct Invoker {
    provider: Arc<dyn LlmProvider>,
    sessions: Arc<SessionStore>,
    catalog: Arc<ToolCatalog>,
    agent_cfg: AgentConfig,
    compaction_cfg: CompactionConfig,
}

impl Invoker {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        sessions: Arc<SessionStore>,
        catalog: Arc<ToolCatalog>,
        agent_cfg: AgentConfig,
        compaction_cfg: CompactionConfig,
    ) -> Self {
        Self {
            provider,
            sessions,
            catalog,
            agent_cfg,
            compaction_cfg,
        }
    }

    /// One LLM call with the full recovery ladder.  Does not append the
    /// result to history — that is the runner's decision.
    pub async fn invoke(
        &self,
        session_id: &str,
        new_messages: &[Message],
        tool_names: &[String],
        use_tools: bool,
        instructions: Option<&str>,
    ) -> Result<LlmResult> {
        self.check_context_floor()?;

        let tools = if use_tools {
            self.catalog.resolve(tool_names)
        } else {
            Vec::new()
        };

        let mut overflow_retries: u32 = 0;
        let mut truncation_attempted = false;
        let mut llm_retries: u32 = 0;
        let mut proactive_done = false;

        loop {
            if !proactive_done {
                self.maybe_proactive_compact(session_id, new_messages).await;
                proactive_done = true;
            }

            let payload = self.assemble(session_id, new_messages, tool_names, instructions);
            let req = ChatRequest {
                messages: payload.clone(),
                tools: tools.clone(),
                temperature: None,
                max_tokens: None,
                model: None,
            };

            let err = match self.provider.chat(&req).await {
                Ok(resp) => return Ok(to_llm_result(resp)),
                Err(e) => e,
            };
            let err_text = err.to_string();

            if is_overflow_message(&err_text) {
                let (retries, recovered, attempted) = self
                    .try_overflow_recovery(session_id, overflow_retries, truncation_attempted)
                    .await;
                overflow_retries = retries;
                truncation_attempted = attempted;
                if recovered {
                    continue;
                }
                return Err(Error::ContextOverflow(err_text));
            }

            if is_retryable_message(&err_text)
                && !is_thought_signature_message(&err_text)
                && llm_retries < self.agent_cfg.max_llm_retries
            {
                llm_retries += 1;
                let delay = self.agent_cfg.llm_retry_base_delay_secs
                    * 2f64.powi(llm_retries as i32 - 1);
                tracing::warn!(
                    session_id,
                    attempt = llm_retries,
                    max = self.agent_cfg.max_llm_retries,
                    delay_secs = delay,
                    error = %err_text,
                    "retryable LLM error, backing off"
                );
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                continue;
            }

            // Fallback 1: same payload without tools.
            if !tools.is_empty() {
                tracing::warn!(session_id, error = %err_text, "retrying without tools");
                let no_tools = ChatRequest {
                    messages: payload.clone(),
                    tools: vec![],
                    ..req.clone()
                };
                match self.provider.chat(&no_tools).await {
                    Ok(resp) => return Ok(to_llm_result(resp)),
                    Err(e) => tracing::warn!(error = %e, "no-tools fallback also failed"),
                }
            }

            // Fallback 2: clean context — replace tool traffic with plain
            // text so replay metadata can't fail validation.
            let (clean, changed) = strip_tool_messages(&payload);
            if changed {
                tracing::warn!(session_id, "retrying with tool messages stripped from history");
                let clean_req = ChatRequest {
                    messages: clean,
                    tools: vec![],
                    ..req
                };
                match self.provider.chat(&clean_req).await {
                    Ok(resp) => return Ok(to_llm_result(resp)),
                    Err(e) => tracing::warn!(error = %e, "clean-context fallback also failed"),
                }
            }

            return Err(err);
        }
    }

    /// Streaming variant: identical recovery around stream establishment —
    /// overflow compaction, transient-error backoff, then the no-tools and
    /// clean-context fallbacks.  Once the stream is open, events flow
    /// through untouched.
    pub async fn invoke_stream(
        &self,
        session_id: &str,
        new_messages: &[Message],
        tool_names: &[String],
        use_tools: bool,
        instructions: Option<&str>,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.check_context_floor()?;

        let tools = if use_tools {
            self.catalog.resolve(tool_names)
        } else {
            Vec::new()
        };

        self.maybe_proactive_compact(session_id, new_messages).await;

        let mut overflow_retries: u32 = 0;
        let mut truncation_attempted = false;
        let mut llm_retries: u32 = 0;

        loop {
            let payload = self.assemble(session_id, new_messages, tool_names, instructions);
            let req = ChatRequest {
                messages: payload.clone(),
                tools: tools.clone(),
                temperature: None,
                max_tokens: None,
                model: None,
            };

            let err = match self.provider.chat_stream(&req).await {
                Ok(stream) => return Ok(stream),
                Err(e) => e,
            };
            let err_text = err.to_string();

            if is_overflow_message(&err_text) {
                let (retries, recovered, attempted) = self
                    .try_overflow_recovery(session_id, overflow_retries, truncation_attempted)
                    .await;
                overflow_retries = retries;
                truncation_attempted = attempted;
                if recovered {
                    continue;
                }
                return Err(Error::ContextOverflow(err_text));
            }

            if is_retryable_message(&err_text)
                && !is_thought_signature_message(&err_text)
                && llm_retries < self.agent_cfg.max_llm_retries
            {
                llm_retries += 1;
                let delay = self.agent_cfg.llm_retry_base_delay_secs
                    * 2f64.powi(llm_retries as i32 - 1);
                tracing::warn!(
                    session_id,
                    attempt = llm_retries,
                    max = self.agent_cfg.max_llm_retries,
                    delay_secs = delay,
                    error = %err_text,
                    "retryable LLM stream error, backing off"
                );
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                continue;
            }

            // Fallback 1: same payload without tools.
            if !tools.is_empty() {
                tracing::warn!(session_id, error = %err_text, "retrying stream without tools");
                let no_tools = ChatRequest {
                    messages: payload.clone(),
                    tools: vec![],
                    ..req.clone()
                };
                match self.provider.chat_stream(&no_tools).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => tracing::warn!(error = %e, "no-tools fallback also failed"),
                }
            }

            // Fallback 2: clean context — replace tool traffic with plain
            // text so replay metadata can't fail validation.
            let (clean, changed) = strip_tool_messages(&payload);
            if changed {
                tracing::warn!(session_id, "retrying stream with tool messages stripped");
                let clean_req = ChatRequest {
                    messages: clean,
                    tools: vec![],
                    ..req
                };
                match self.provider.chat_stream(&clean_req).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => tracing::warn!(error = %e, "clean-context fallback also failed"),
                }
            }

            return Err(err);
        }
    }

    // ── Payload assembly ──────────────────────────────────────────

    fn assemble(
        &self,
        session_id: &str,
        new_messages: &[Message],
        tool_names: &[String],
        instructions: Option<&str>,
    ) -> Vec<Message> {
        let external = self.catalog.external_schemas();
        let system = build_system_prompt(tool_names, &external, instructions);

        let mut payload = Vec::with_capacity(2 + new_messages.len());
        payload.push(Message::system(system));
        payload.extend(self.sessions.history(session_id));
        payload.extend(new_messages.iter().cloned());
        payload
    }

    fn check_context_floor(&self) -> Result<()> {
        let ctx = self.compaction_cfg.context_window_tokens;
        if ctx < self.agent_cfg.context_window_hard_min_tokens {
            return Err(Error::InvalidRequest(format!(
                "context window too small: {ctx} tokens (minimum {})",
                self.agent_cfg.context_window_hard_min_tokens
            )));
        }
        Ok(())
    }

    // ── Compaction ────────────────────────────────────────────────

    /// Run the 3-layer pipeline on a session and write the result back.
    pub async fn compact_session(&self, session_id: &str) {
        let lock = self.sessions.history_lock(session_id);
        let _guard = lock.lock().await;

        let history = self.sessions.history(session_id);
        if history.is_empty() {
            return;
        }

        let (history, truncated) =
            truncate_oversized_tool_results(&history, &self.compaction_cfg);
        if truncated > 0 {
            tracing::info!(session_id, truncated, "layer 1: truncated tool result(s)");
        }

        let history = prune_context_messages(&history, &self.compaction_cfg);
        let history =
            compact_history(&history, self.provider.as_ref(), &self.compaction_cfg).await;

        self.sessions.set_history(session_id, history);
    }

    /// Compact before the next call when the last recorded input-token
    /// count (or the estimator) says the window is nearly full.
    async fn maybe_proactive_compact(&self, session_id: &str, new_messages: &[Message]) {
        let ctx_tokens = self.compaction_cfg.context_window_tokens;
        if ctx_tokens == 0 {
            return;
        }

        let history = self.sessions.history(session_id);
        let last_input_tokens = history
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && m.usage.is_some())
            .and_then(|m| m.usage)
            .map(|u| u.input_tokens);

        let ratio = match last_input_tokens {
            Some(tokens) => tokens as f64 / ctx_tokens as f64,
            None => {
                let mut all = history;
                all.extend(new_messages.iter().cloned());
                estimate_messages_tokens(&all, self.compaction_cfg.chars_per_token) as f64
                    / ctx_tokens as f64
            }
        };

        if ratio >= self.compaction_cfg.proactive_pruning_ratio {
            tracing::info!(
                session_id,
                ratio = format!("{ratio:.2}"),
                threshold = self.compaction_cfg.proactive_pruning_ratio,
                "proactive compaction triggered"
            );
            self.compact_session(session_id).await;
        }
    }

    /// Overflow recovery ladder.  Returns (overflow_retries, recovered,
    /// truncation_attempted).
    async fn try_overflow_recovery(
        &self,
        session_id: &str,
        overflow_retries: u32,
        truncation_attempted: bool,
    ) -> (u32, bool, bool) {
        let max = self.agent_cfg.max_overflow_retries;

        if overflow_retries < max {
            tracing::warn!(
                session_id,
                attempt = overflow_retries + 1,
                max,
                "context overflow, compacting"
            );
            let before = estimate_messages_tokens(
                &self.sessions.history(session_id),
                self.compaction_cfg.chars_per_token,
            );
            self.compact_session(session_id).await;
            let after = estimate_messages_tokens(
                &self.sessions.history(session_id),
                self.compaction_cfg.chars_per_token,
            );

            if after >= before {
                tracing::warn!(
                    session_id,
                    before,
                    after,
                    "compaction did not reduce size, skipping to truncation fallback"
                );
                return (max, true, truncation_attempted);
            }
            return (overflow_retries + 1, true, truncation_attempted);
        }

        if truncation_attempted {
            tracing::error!(session_id, "truncation already attempted once; giving up");
            return (overflow_retries, false, true);
        }

        // One-shot aggressive truncation: thresholds divided by 4, capped.
        let aggressive = CompactionConfig {
            max_tool_result_context_share: self.compaction_cfg.max_tool_result_context_share
                / 4.0,
            hard_max_tool_result_chars: (self.compaction_cfg.hard_max_tool_result_chars / 4)
                .min(50_000),
            ..self.compaction_cfg.clone()
        };

        let lock = self.sessions.history_lock(session_id);
        let _guard = lock.lock().await;
        let history = self.sessions.history(session_id);
        let (history, truncated) = truncate_oversized_tool_results(&history, &aggressive);
        self.sessions.set_history(session_id, history);

        if truncated > 0 {
            tracing::info!(
                session_id,
                truncated,
                "aggressively truncated tool result(s); resetting overflow counter"
            );
            return (0, true, true);
        }

        tracing::error!(session_id, "all overflow recovery strategies exhausted");
        (overflow_retries, false, true)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn to_llm_result(resp: cadence_providers::ChatResponse) -> LlmResult {
    let usage = resp.usage.unwrap_or_default();
    let mut assistant = Message::assistant(resp.content.clone());
    assistant.usage = Some(usage);
    assistant.provider_raw = resp.provider_raw;

    if resp.tool_calls.is_empty() {
        LlmResult::Text {
            text: resp.content,
            usage,
            assistant,
        }
    } else {
        assistant.tool_calls = Some(resp.tool_calls.clone());
        LlmResult::ToolCalls {
            calls: resp.tool_calls,
            usage,
            assistant,
        }
    }
}

/// Convert tool traffic into plain text equivalents, dropping provider
/// metadata.  Recovers from validation errors that hinge on replayed
/// tool-result metadata.
pub(crate) fn strip_tool_messages(messages: &[Message]) -> (Vec<Message>, bool) {
    let mut changed = false;
    let clean = messages
        .iter()
        .map(|msg| {
            if msg.role == Role::Assistant && msg.has_tool_calls() {
                changed = true;
                let summary: Vec<String> = msg
                    .tool_calls
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|tc| format!("{}({})", tc.name, tc.args))
                    .collect();
                Message::assistant(format!("[Called: {}]", summary.join("; ")))
            } else if msg.role == Role::Tool {
                changed = true;
                Message::user(format!("[Tool result]: {}", msg.content))
            } else if msg.role == Role::Assistant && msg.provider_raw.is_some() {
                changed = true;
                Message::assistant(msg.content.clone())
            } else {
                msg.clone()
            }
        })
        .collect();
    (clean, changed)
}
