//! MCP client — dynamic tool discovery and dispatch over streamable HTTP.
//!
//! Tools are discovered from configured MCP server URLs with a short-TTL
//! cache.  Tool `_meta` may carry chain rules and approval flags; the
//! discovery result surfaces both so the composition root can register
//! them with the chain registry and approval gate.

pub mod client;
pub mod protocol;

pub use client::{DiscoveredTool, McpClient};
pub use protocol::ChainMeta;
