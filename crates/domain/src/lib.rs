//! Shared domain types for the Cadence runtime.
//!
//! Everything the runtime crates agree on lives here: the canonical
//! message form, tool call descriptors, the `/v1/responses` wire schema,
//! streaming events, the shared error enum, and runtime configuration.

pub mod config;
pub mod error;
pub mod message;
pub mod responses;
pub mod stream;

pub use error::{Error, Result};
pub use message::{LlmResult, Message, Role, ToolCall, ToolSchema, Usage, COMPACTION_MARKER};
