//! Layer 3 — LLM summarization.
//!
//! Collapses the removable prefix of a history into one summary system
//! message.  Chunked by an adaptive token budget, with three fallback
//! strategies:
//!   1. Single pass over chunks.
//!   2. Skip oversized-for-summary messages with a note, summarize the rest.
//!   3. Split into halves, summarize each, merge.
//!
//! An existing summary is updated incrementally rather than regenerated.

use cadence_domain::config::CompactionConfig;
use cadence_domain::error::Result;
use cadence_domain::message::{Message, Role, COMPACTION_MARKER};
use cadence_providers::{ChatRequest, LlmProvider};

use crate::prompts::{
    compaction_prompt, compaction_update_prompt, COMPACTION_SYSTEM_PROMPT,
    DEFAULT_SUMMARY_FALLBACK, MERGE_INSTRUCTIONS,
};
use crate::repair::repair_tool_pairing;
use crate::tokens::{estimate_messages_tokens, estimate_tokens};

const SUMMARY_MAX_TOKENS: u32 = 2_000;
const SPLIT_PARTS: usize = 2;
const MIN_MESSAGES_FOR_SPLIT: usize = 4;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serialization for the summarizer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_CHARS_PER_MESSAGE: usize = 2_000;

/// Serialize messages as role-prefixed text sections.  The text-only form
/// keeps the model from treating the content as a conversation to continue.
fn messages_to_text(messages: &[Message]) -> String {
    let mut parts: Vec<String> = Vec::new();

    for msg in messages {
        let end = crate::truncate::floor_char_boundary(&msg.content, MAX_CHARS_PER_MESSAGE);
        let content = &msg.content[..end];

        match msg.role {
            Role::User => {
                if !content.is_empty() {
                    parts.push(format!("[User]: {content}"));
                }
            }
            Role::Assistant => {
                if !content.is_empty() {
                    parts.push(format!("[Assistant]: {content}"));
                }
                if let Some(calls) = &msg.tool_calls {
                    if !calls.is_empty() {
                        let rendered: Vec<String> = calls
                            .iter()
                            .map(|tc| format!("{}({})", tc.name, tc.args))
                            .collect();
                        parts.push(format!("[Assistant tool calls]: {}", rendered.join("; ")));
                    }
                }
            }
            Role::Tool => {
                if !content.is_empty() {
                    let label = match &msg.tool_name {
                        Some(name) => format!("[Tool result ({name})]"),
                        None => "[Tool result]".to_string(),
                    };
                    parts.push(format!("{label}: {content}"));
                }
            }
            Role::System => {
                if !content.is_empty() {
                    parts.push(format!("[System]: {content}"));
                }
            }
        }
    }

    parts.join("\n\n")
}

async fn generate_summary(
    messages: &[Message],
    provider: &dyn LlmProvider,
    previous_summary: Option<&str>,
) -> Result<String> {
    let conversation = messages_to_text(messages);
    if conversation.trim().is_empty() {
        return Ok(previous_summary
            .unwrap_or(DEFAULT_SUMMARY_FALLBACK)
            .to_string());
    }

    let prompt = match previous_summary {
        Some(prev) => compaction_update_prompt(&conversation, prev),
        None => compaction_prompt(&conversation),
    };

    let req = ChatRequest {
        messages: vec![
            Message::system(COMPACTION_SYSTEM_PROMPT),
            Message::user(prompt),
        ],
        tools: vec![],
        temperature: Some(0.1),
        max_tokens: Some(SUMMARY_MAX_TOKENS),
        model: None,
    };

    let resp = provider.chat(&req).await?;
    Ok(resp.content)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chunking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn chunk_by_max_tokens(
    messages: &[Message],
    max_tokens: u64,
    chars_per_token: f64,
) -> Vec<Vec<Message>> {
    let mut chunks: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens: u64 = 0;

    for msg in messages {
        let msg_tokens = estimate_tokens(&msg.content, chars_per_token);

        if !current.is_empty() && current_tokens + msg_tokens > max_tokens {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }

        current.push(msg.clone());
        current_tokens += msg_tokens;

        // A single over-budget message forms its own chunk.
        if msg_tokens > max_tokens {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split messages into `parts` roughly equal by token count.
fn split_by_token_share(
    messages: &[Message],
    parts: usize,
    chars_per_token: f64,
) -> Vec<Vec<Message>> {
    if messages.is_empty() {
        return Vec::new();
    }
    if parts <= 1 {
        return vec![messages.to_vec()];
    }

    let parts = parts.min(messages.len());
    let total = estimate_messages_tokens(messages, chars_per_token);
    let target = total as f64 / parts as f64;

    let mut chunks: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens: f64 = 0.0;

    for msg in messages {
        let msg_tokens = estimate_tokens(&msg.content, chars_per_token) as f64;
        if chunks.len() < parts - 1 && !current.is_empty() && current_tokens + msg_tokens > target
        {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0.0;
        }
        current.push(msg.clone());
        current_tokens += msg_tokens;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Reduce the chunk ratio when the average message is large relative to
/// the window, so a single chunk never dominates the summarizer call.
fn compute_adaptive_chunk_ratio(messages: &[Message], cfg: &CompactionConfig) -> f64 {
    if messages.is_empty() {
        return cfg.base_chunk_ratio;
    }

    let total = estimate_messages_tokens(messages, cfg.chars_per_token) as f64;
    let avg = total / messages.len() as f64;
    let avg_ratio = (avg * cfg.safety_margin) / cfg.context_window_tokens as f64;

    if avg_ratio > 0.1 {
        let reduction = (avg_ratio * 2.0).min(cfg.base_chunk_ratio - cfg.min_chunk_ratio);
        (cfg.base_chunk_ratio - reduction).max(cfg.min_chunk_ratio)
    } else {
        cfg.base_chunk_ratio
    }
}

/// A single message above half the context window cannot be summarized
/// safely.
fn is_oversized_for_summary(msg: &Message, cfg: &CompactionConfig) -> bool {
    let tokens = estimate_tokens(&msg.content, cfg.chars_per_token) as f64 * cfg.safety_margin;
    tokens > cfg.context_window_tokens as f64 * 0.5
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Summarization strategies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn summarize_chunks(
    messages: &[Message],
    provider: &dyn LlmProvider,
    max_chunk_tokens: u64,
    chars_per_token: f64,
    previous_summary: Option<&str>,
) -> Result<String> {
    if messages.is_empty() {
        return Ok(previous_summary
            .unwrap_or(DEFAULT_SUMMARY_FALLBACK)
            .to_string());
    }

    let chunks = chunk_by_max_tokens(messages, max_chunk_tokens, chars_per_token);
    let mut summary: Option<String> = previous_summary.map(String::from);

    for chunk in chunks {
        summary = Some(generate_summary(&chunk, provider, summary.as_deref()).await?);
    }

    Ok(summary.unwrap_or_else(|| DEFAULT_SUMMARY_FALLBACK.to_string()))
}

async fn summarize_with_fallback(
    messages: &[Message],
    provider: &dyn LlmProvider,
    cfg: &CompactionConfig,
    max_chunk_tokens: u64,
    previous_summary: Option<&str>,
) -> String {
    if messages.is_empty() {
        return previous_summary
            .unwrap_or(DEFAULT_SUMMARY_FALLBACK)
            .to_string();
    }

    match summarize_chunks(
        messages,
        provider,
        max_chunk_tokens,
        cfg.chars_per_token,
        previous_summary,
    )
    .await
    {
        Ok(summary) => return summary,
        Err(e) => tracing::warn!(error = %e, "full summarization failed, trying partial"),
    }

    let mut small: Vec<Message> = Vec::new();
    let mut oversized_notes: Vec<String> = Vec::new();

    for msg in messages {
        if is_oversized_for_summary(msg, cfg) {
            let tokens = estimate_tokens(&msg.content, cfg.chars_per_token);
            oversized_notes.push(format!(
                "[Large {} message (~{}K tokens) omitted from summary]",
                role_label(msg.role),
                tokens / 1_000
            ));
        } else {
            small.push(msg.clone());
        }
    }

    if !small.is_empty() {
        match summarize_chunks(
            &small,
            provider,
            max_chunk_tokens,
            cfg.chars_per_token,
            previous_summary,
        )
        .await
        {
            Ok(partial) => {
                return if oversized_notes.is_empty() {
                    partial
                } else {
                    format!("{partial}\n\n{}", oversized_notes.join("\n"))
                };
            }
            Err(e) => tracing::warn!(error = %e, "partial summarization also failed"),
        }
    }

    format!(
        "Context contained {} messages ({} oversized). Summary unavailable due to size limits.",
        messages.len(),
        oversized_notes.len()
    )
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

async fn summarize_in_stages(
    messages: &[Message],
    provider: &dyn LlmProvider,
    cfg: &CompactionConfig,
    max_chunk_tokens: u64,
    previous_summary: Option<&str>,
) -> String {
    if messages.is_empty() {
        return previous_summary
            .unwrap_or(DEFAULT_SUMMARY_FALLBACK)
            .to_string();
    }

    let total = estimate_messages_tokens(messages, cfg.chars_per_token);

    if messages.len() < MIN_MESSAGES_FOR_SPLIT || total <= max_chunk_tokens {
        return summarize_with_fallback(messages, provider, cfg, max_chunk_tokens, previous_summary)
            .await;
    }

    let splits: Vec<Vec<Message>> =
        split_by_token_share(messages, SPLIT_PARTS, cfg.chars_per_token)
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
    if splits.len() <= 1 {
        return summarize_with_fallback(messages, provider, cfg, max_chunk_tokens, previous_summary)
            .await;
    }

    let mut partials: Vec<String> = Vec::new();
    for (idx, chunk) in splits.iter().enumerate() {
        let chunk_prev = if idx == 0 { previous_summary } else { None };
        partials
            .push(summarize_with_fallback(chunk, provider, cfg, max_chunk_tokens, chunk_prev).await);
    }

    if partials.len() == 1 {
        return partials.remove(0);
    }

    let merge_messages: Vec<Message> = partials.into_iter().map(Message::user).collect();
    summarize_with_fallback(
        &merge_messages,
        provider,
        cfg,
        max_chunk_tokens,
        Some(MERGE_INSTRUCTIONS),
    )
    .await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// compact_history — the layer-3 entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compact a history by LLM summarization.
///
/// - An existing compaction summary is updated incrementally.
/// - The last `keep_last_assistants` assistants stay byte-identical so
///   provider metadata round-trips.
/// - The cutoff never separates an assistant's tool calls from their
///   results, and never reaches before the first user message.
/// - Orphan tool results in the kept tail are dropped.
///
/// Returns the original list unchanged when compaction is disabled or
/// there is nothing to summarize.
pub async fn compact_history(
    messages: &[Message],
    provider: &dyn LlmProvider,
    cfg: &CompactionConfig,
) -> Vec<Message> {
    if !cfg.enabled || messages.is_empty() {
        return messages.to_vec();
    }

    // Locate an existing summary; summarization resumes after it.
    let mut previous_summary: Option<String> = None;
    let mut start_idx = 0;
    for (i, msg) in messages.iter().enumerate() {
        if msg.is_compaction_summary() {
            previous_summary = Some(
                msg.content[COMPACTION_MARKER.len()..]
                    .trim()
                    .to_string(),
            );
            start_idx = i + 1;
            break;
        }
    }

    // Never summarize before the first user message.
    if let Some(first_user) = messages.iter().position(|m| m.role == Role::User) {
        start_idx = start_idx.max(first_user);
    }

    // Kept-tail cutoff: protect the last N assistants.  When the tail
    // already covers every assistant there is nothing left to remove —
    // running compaction again right away is a no-op.
    let keep = cfg.keep_last_assistants;
    let assistant_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::Assistant)
        .map(|(i, _)| i)
        .collect();
    let mut cutoff = if keep == 0 {
        messages.len()
    } else if assistant_indices.len() > keep {
        assistant_indices[assistant_indices.len() - keep]
    } else {
        return messages.to_vec();
    };
    cutoff = cutoff.max(start_idx);

    // Don't split an assistant's tool calls from their results: walk the
    // cutoff back over tool messages and their originating assistant.
    while cutoff > start_idx && cutoff < messages.len() {
        if messages[cutoff].role == Role::Tool {
            cutoff -= 1;
            continue;
        }
        if cutoff > 0 && messages[cutoff - 1].has_tool_calls() {
            cutoff -= 1;
            break;
        }
        break;
    }

    let to_summarize = &messages[start_idx..cutoff];
    if to_summarize.is_empty() {
        return messages.to_vec();
    }

    let chunk_ratio = compute_adaptive_chunk_ratio(to_summarize, cfg);
    let max_chunk_tokens = (cfg.context_window_tokens as f64 * chunk_ratio) as u64;

    let summary_text = summarize_in_stages(
        to_summarize,
        provider,
        cfg,
        max_chunk_tokens,
        previous_summary.as_deref(),
    )
    .await;

    let report = repair_tool_pairing(messages[cutoff..].to_vec());
    if report.dropped_orphan_count > 0 {
        tracing::info!(
            dropped = report.dropped_orphan_count,
            "dropped orphaned tool result(s) after compaction"
        );
    }

    let mut compacted =
        vec![Message::system(format!("{COMPACTION_MARKER}\n{summary_text}"))];
    compacted.extend(report.messages);

    tracing::info!(
        before = messages.len(),
        after = compacted.len(),
        summary_tokens = estimate_tokens(&summary_text, cfg.chars_per_token),
        "history compacted"
    );
    compacted
}
