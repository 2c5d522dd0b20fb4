//! Cadence gateway — the agentic orchestration runtime.
//!
//! Given a conversation turn, the gateway drives a bounded loop of LLM
//! calls and tool executions until the model returns a terminal text
//! answer, an approval request, a client-side tool call, or the iteration
//! budget runs out.  Sessions persist across turns with three-layer
//! context compaction; a periodic scheduler feeds the same loop with
//! headless turns.

pub mod api;
pub mod persist;
pub mod prompts;
pub mod runtime;
pub mod state;
