//! Tool catalog and chaining.
//!
//! [`ToolCatalog`] is the process-wide registry of tool descriptors:
//! built-in tools plus MCP-discovered ones.  Client-side / server-side and
//! approval-required are attributes of the descriptor, not subclasses.
//!
//! [`ChainRegistry`] holds declarative `source → [step, …]` rules and
//! per-session step cursors for multi-step tool chaining.

pub mod catalog;
pub mod chain;

pub use catalog::{ToolCatalog, ToolDescriptor};
pub use chain::{ChainRegistry, ChainRule, ChainStep};
