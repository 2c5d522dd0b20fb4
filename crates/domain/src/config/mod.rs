//! Runtime configuration, loadable from TOML with full serde defaults.

mod agent;
mod compaction;
mod llm;
mod scheduler;

pub use agent::*;
pub use compaction::*;
pub use llm::*;
pub use scheduler::*;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP server.
    #[serde(default = "d_bind")]
    pub bind: String,
    /// Directory for persisted state (responses, questions, tasks).
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: d_bind(),
            state_path: d_state_path(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Base URLs of MCP servers to discover tools from.
    #[serde(default)]
    pub server_urls: Vec<String>,
    /// Discovery cache TTL in seconds.
    #[serde(default = "d_300")]
    pub tool_cache_ttl_secs: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            server_urls: Vec::new(),
            tool_cache_ttl_secs: 300,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Platform (session files, notifications)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Base URL of the platform service (file storage, push delivery).
    #[serde(default = "d_platform_url")]
    pub base_url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "d_30")]
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: d_platform_url(),
            request_timeout_secs: 30,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_bind() -> String {
    "0.0.0.0:8088".into()
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}
fn d_platform_url() -> String {
    "http://localhost:8000".into()
}
fn d_300() -> u64 {
    300
}
fn d_30() -> u64 {
    30
}
