use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent loop limits & session lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum tool iterations per turn before forcing `incomplete`.
    #[serde(default = "d_50")]
    pub max_iterations: u32,
    /// Maximum compaction attempts during overflow recovery.
    #[serde(default = "d_3")]
    pub max_overflow_retries: u32,
    /// Maximum retries for transient provider errors.
    #[serde(default = "d_3")]
    pub max_llm_retries: u32,
    /// Base delay for exponential backoff on transient errors, in seconds.
    #[serde(default = "d_1f")]
    pub llm_retry_base_delay_secs: f64,
    /// Sessions idle longer than this are evicted (unless locked).
    #[serde(default = "d_3600")]
    pub session_ttl_seconds: u64,
    /// LRU cap on the number of in-memory sessions.
    #[serde(default = "d_500")]
    pub max_sessions: usize,
    /// Refuse to run if the configured context window is below this.
    #[serde(default = "d_8192")]
    pub context_window_hard_min_tokens: u64,
    /// Per-tool-call timeout in seconds.
    #[serde(default = "d_30")]
    pub tool_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_overflow_retries: 3,
            max_llm_retries: 3,
            llm_retry_base_delay_secs: 1.0,
            session_ttl_seconds: 3_600,
            max_sessions: 500,
            context_window_hard_min_tokens: 8_192,
            tool_timeout_secs: 30,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_50() -> u32 {
    50
}
fn d_3() -> u32 {
    3
}
fn d_1f() -> f64 {
    1.0
}
fn d_3600() -> u64 {
    3_600
}
fn d_500() -> usize {
    500
}
fn d_8192() -> u64 {
    8_192
}
fn d_30() -> u64 {
    30
}
