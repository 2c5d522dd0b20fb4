//! LLM provider adapters.
//!
//! [`LlmProvider`] is the seam the invoker calls through: a full-response
//! `chat` and a streaming `chat_stream`.  Adapters translate between the
//! canonical message form and each provider's wire format, preserving
//! opaque provider metadata (`provider_raw`) in both directions.

pub mod openai_compat;
pub mod sse;
pub mod traits;

pub use openai_compat::OpenAiCompatProvider;
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
