//! Layer 2 — selective context pruning.
//!
//! Two-phase strategy applied to old tool results:
//!   Phase 1  soft-trim:   keep head + tail   (ratio >= soft_trim_ratio)
//!   Phase 2  hard-clear:  replace with placeholder  (ratio >= hard_clear_ratio)
//!
//! Recent assistant messages (`keep_last_assistants`) and everything before
//! the first user message are always protected.  Per-tool glob allow/deny
//! lists govern eligibility; deny wins.

use cadence_domain::config::{CompactionConfig, ToolPruningConfig};
use cadence_domain::message::{Message, Role};

use crate::tokens::estimate_message_chars;
use crate::truncate::{ceil_char_boundary, floor_char_boundary};

/// Whether a tool result may be pruned under the allow/deny pattern lists.
pub fn is_tool_prunable(tool_name: Option<&str>, config: &ToolPruningConfig) -> bool {
    if config.deny.is_empty() && config.allow.is_empty() {
        return true;
    }

    let name = tool_name.unwrap_or("").trim().to_lowercase();

    for pattern in &config.deny {
        if matches(&pattern.trim().to_lowercase(), &name) {
            return false;
        }
    }

    if !config.allow.is_empty() {
        return config
            .allow
            .iter()
            .any(|pattern| matches(&pattern.trim().to_lowercase(), &name));
    }

    true
}

fn matches(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(name))
        .unwrap_or(false)
}

/// Index of the Nth-from-last assistant message.  Everything before it is
/// eligible for pruning.  With fewer than N assistants, all of them sit in
/// the protected tail, so nothing is prunable (index 0).
fn find_assistant_cutoff_index(messages: &[Message], keep_last_assistants: usize) -> usize {
    if keep_last_assistants == 0 {
        return messages.len();
    }

    let mut remaining = keep_last_assistants;
    for (i, msg) in messages.iter().enumerate().rev() {
        if msg.role == Role::Assistant {
            remaining -= 1;
            if remaining == 0 {
                return i;
            }
        }
    }
    0
}

/// Index of the first user message.  Identity/bootstrap messages before it
/// are protected.
fn find_first_user_index(messages: &[Message]) -> Option<usize> {
    messages.iter().position(|m| m.role == Role::User)
}

/// Keep head + tail of the text with a trimming note.
fn soft_trim_content(text: &str, head_chars: usize, tail_chars: usize) -> String {
    let head = &text[..floor_char_boundary(text, head_chars)];
    let tail = if tail_chars > 0 {
        &text[ceil_char_boundary(text, text.len().saturating_sub(tail_chars))..]
    } else {
        ""
    };
    format!(
        "{head}\n...\n{tail}\n\n[Tool result trimmed: kept first {head_chars} and last {tail_chars} chars of {} chars.]",
        text.len()
    )
}

fn soft_trim_message(msg: &Message, cfg: &CompactionConfig) -> Option<Message> {
    if msg.content.len() <= cfg.soft_trim.max_chars {
        return None;
    }
    let head = cfg.soft_trim.head_chars;
    let tail = cfg.soft_trim.tail_chars;
    if head + tail >= msg.content.len() {
        return None;
    }
    Some(Message {
        content: soft_trim_content(&msg.content, head, tail),
        ..msg.clone()
    })
}

/// Prune context messages with the 2-phase strategy.  Returns the original
/// list untouched when the usage ratio is below `soft_trim_ratio`.
pub fn prune_context_messages(messages: &[Message], cfg: &CompactionConfig) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    let char_window = cfg.context_window_chars();
    if char_window == 0 {
        return messages.to_vec();
    }

    let cutoff = find_assistant_cutoff_index(messages, cfg.keep_last_assistants);
    let prune_start = find_first_user_index(messages).unwrap_or(0);

    let mut total = crate::tokens::total_chars(messages);
    let mut ratio = total as f64 / char_window as f64;

    if ratio < cfg.soft_trim_ratio {
        return messages.to_vec();
    }

    let mut result: Vec<Message> = messages.to_vec();
    let mut prunable: Vec<usize> = Vec::new();

    // Phase 1 — soft trim.
    for i in prune_start..cutoff {
        let msg = &messages[i];
        if msg.role != Role::Tool {
            continue;
        }
        if !is_tool_prunable(msg.tool_name.as_deref(), &cfg.tool_pruning) {
            continue;
        }
        prunable.push(i);

        if let Some(trimmed) = soft_trim_message(msg, cfg) {
            let before = estimate_message_chars(msg);
            let after = estimate_message_chars(&trimmed);
            total = total.saturating_sub(before) + after;
            result[i] = trimmed;
        }
    }

    ratio = total as f64 / char_window as f64;
    if ratio < cfg.hard_clear_ratio || !cfg.hard_clear.enabled {
        return result;
    }

    let prunable_chars: usize = prunable
        .iter()
        .map(|&i| estimate_message_chars(&result[i]))
        .sum();
    if prunable_chars < cfg.min_prunable_tool_chars {
        return result;
    }

    // Phase 2 — hard clear, oldest first, until the ratio drops.
    for i in prunable {
        if ratio < cfg.hard_clear_ratio {
            break;
        }
        let before = estimate_message_chars(&result[i]);
        result[i] = Message {
            content: cfg.hard_clear.placeholder.clone(),
            ..result[i].clone()
        };
        let after = estimate_message_chars(&result[i]);
        total = total.saturating_sub(before) + after;
        ratio = total as f64 / char_window as f64;
    }

    result
}
