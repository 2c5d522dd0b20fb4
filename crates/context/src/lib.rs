//! Context management — token estimation and the three-layer compaction
//! pipeline that keeps session histories inside the model's context window.
//!
//! Layers, applied in order only when triggered:
//! 1. [`truncate`] — oversized tool results cut to head + tail.
//! 2. [`prune`] — old tool results soft-trimmed, then hard-cleared.
//! 3. [`summarize`] — the removable prefix collapsed into one summary
//!    system message marked with [`cadence_domain::COMPACTION_MARKER`].

pub mod prompts;
pub mod prune;
pub mod repair;
pub mod summarize;
pub mod tokens;
pub mod truncate;

pub use prune::prune_context_messages;
pub use summarize::compact_history;
pub use tokens::{estimate_message_chars, estimate_messages_tokens, estimate_tokens};
pub use truncate::truncate_oversized_tool_results;
