//! Layer 1 — oversized tool-result truncation.
//!
//! A single tool result larger than its context share is replaced with its
//! head + tail and a trimming note.  Non-tool messages are never touched.

use cadence_domain::config::CompactionConfig;
use cadence_domain::message::{Message, Role};

/// Effective per-result character cap: the smaller of the context-share
/// budget and the absolute cap.
pub fn tool_result_char_cap(cfg: &CompactionConfig) -> usize {
    let share_cap =
        (cfg.context_window_chars() as f64 * cfg.max_tool_result_context_share) as usize;
    share_cap.min(cfg.hard_max_tool_result_chars)
}

/// Truncate tool results exceeding the cap.  Returns the (possibly new)
/// message list and the number of results truncated.
pub fn truncate_oversized_tool_results(
    messages: &[Message],
    cfg: &CompactionConfig,
) -> (Vec<Message>, usize) {
    let cap = tool_result_char_cap(cfg);
    if cap == 0 {
        return (messages.to_vec(), 0);
    }

    let mut truncated = 0;
    let result = messages
        .iter()
        .map(|msg| {
            if msg.role != Role::Tool || msg.content.len() <= cap {
                return msg.clone();
            }
            truncated += 1;
            Message {
                content: head_tail(&msg.content, cap),
                ..msg.clone()
            }
        })
        .collect();

    (result, truncated)
}

/// Keep the head and tail of `text` within a total budget of `cap` chars,
/// inserting a trimming note between them.
fn head_tail(text: &str, cap: usize) -> String {
    let head_len = cap / 2;
    let tail_len = cap / 4;
    let head = &text[..floor_char_boundary(text, head_len)];
    let tail = &text[ceil_char_boundary(text, text.len().saturating_sub(tail_len))..];
    format!(
        "{head}\n...\n{tail}\n\n[Tool result truncated: kept first {} and last {} chars of {} chars.]",
        head.len(),
        tail.len(),
        text.len()
    )
}

pub(crate) fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

pub(crate) fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_window() -> CompactionConfig {
        CompactionConfig {
            context_window_tokens: 100,
            chars_per_token: 4.0,
            max_tool_result_context_share: 0.3, // 120 chars
            hard_max_tool_result_chars: 1_000,
            ..Default::default()
        }
    }

    #[test]
    fn cap_is_min_of_share_and_hard_cap() {
        let mut cfg = small_window();
        assert_eq!(tool_result_char_cap(&cfg), 120);
        cfg.hard_max_tool_result_chars = 50;
        assert_eq!(tool_result_char_cap(&cfg), 50);
    }

    #[test]
    fn oversized_tool_result_is_trimmed() {
        let cfg = small_window();
        let big = "x".repeat(500);
        let messages = vec![
            Message::user("q"),
            Message::tool_result("c1", "bash", &big),
        ];
        let (out, n) = truncate_oversized_tool_results(&messages, &cfg);
        assert_eq!(n, 1);
        assert!(out[1].content.len() < big.len());
        assert!(out[1].content.contains("Tool result truncated"));
        // Correlation survives the rewrite.
        assert_eq!(out[1].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn non_tool_messages_never_touched() {
        let cfg = small_window();
        let big = "y".repeat(500);
        let messages = vec![Message::user(&big), Message::assistant(&big)];
        let (out, n) = truncate_oversized_tool_results(&messages, &cfg);
        assert_eq!(n, 0);
        assert_eq!(out[0].content, big);
        assert_eq!(out[1].content, big);
    }

    #[test]
    fn under_cap_results_unchanged() {
        let cfg = small_window();
        let messages = vec![Message::tool_result("c1", "bash", "short")];
        let (out, n) = truncate_oversized_tool_results(&messages, &cfg);
        assert_eq!(n, 0);
        assert_eq!(out[0].content, "short");
    }

    #[test]
    fn multibyte_content_does_not_split_chars() {
        let cfg = small_window();
        let big = "é".repeat(300); // 600 bytes
        let messages = vec![Message::tool_result("c1", "bash", &big)];
        let (out, n) = truncate_oversized_tool_results(&messages, &cfg);
        assert_eq!(n, 1);
        // Must still be valid UTF-8 with intact characters.
        assert!(out[0].content.contains('é'));
    }
}
