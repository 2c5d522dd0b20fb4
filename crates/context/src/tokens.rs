//! Cheap character-based token estimation.
//!
//! Tokens are estimated as `ceil(chars / chars_per_token)`.  A message's
//! character count includes the serialized form of any tool calls so that
//! tool-heavy messages are budgeted correctly.

use cadence_domain::message::Message;

/// Estimate tokens for a plain string.
pub fn estimate_tokens(text: &str, chars_per_token: f64) -> u64 {
    if chars_per_token <= 0.0 {
        return text.len() as u64;
    }
    (text.len() as f64 / chars_per_token).ceil() as u64
}

/// Character count of a message: content plus serialized tool calls.
pub fn estimate_message_chars(msg: &Message) -> usize {
    let mut chars = msg.content.len();
    if let Some(calls) = &msg.tool_calls {
        for tc in calls {
            chars += tc.name.len();
            chars += tc.id.len();
            chars += tc.args.to_string().len();
        }
    }
    chars
}

/// Estimate tokens for a message including its tool-call payload.
pub fn estimate_message_tokens(msg: &Message, chars_per_token: f64) -> u64 {
    if chars_per_token <= 0.0 {
        return estimate_message_chars(msg) as u64;
    }
    (estimate_message_chars(msg) as f64 / chars_per_token).ceil() as u64
}

/// Total estimated tokens for a message list (sum of per-message estimates).
pub fn estimate_messages_tokens(messages: &[Message], chars_per_token: f64) -> u64 {
    messages
        .iter()
        .map(|m| estimate_message_tokens(m, chars_per_token))
        .sum()
}

/// Total character count for a message list.
pub fn total_chars(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_chars).sum()
}
