use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Three-layer compaction pipeline configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for the compaction pipeline: layer 1 tool-result
/// truncation, layer 2 selective pruning, layer 3 LLM summarization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Whether layer-3 LLM summarization may run at all.
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Model context window in tokens.
    #[serde(default = "d_ctx")]
    pub context_window_tokens: u64,
    /// Characters per token used by the estimator.
    #[serde(default = "d_4f")]
    pub chars_per_token: f64,
    /// Ratio of context window at which soft-trim pruning activates.
    #[serde(default = "d_03")]
    pub soft_trim_ratio: f64,
    /// Ratio of context window at which hard-clear pruning activates.
    #[serde(default = "d_05")]
    pub hard_clear_ratio: f64,
    /// Number of recent assistant messages protected from pruning and
    /// summarization.
    #[serde(default = "d_3u")]
    pub keep_last_assistants: usize,
    /// Ratio of context usage at which proactive compaction runs before
    /// the next LLM call.
    #[serde(default = "d_08")]
    pub proactive_pruning_ratio: f64,
    /// Maximum share of the context window a single tool result may occupy
    /// (layer 1).
    #[serde(default = "d_03")]
    pub max_tool_result_context_share: f64,
    /// Absolute cap on a single tool result in characters (layer 1).
    #[serde(default = "d_200k")]
    pub hard_max_tool_result_chars: usize,
    /// Skip hard-clear entirely when prunable tool content is below this.
    #[serde(default = "d_2000")]
    pub min_prunable_tool_chars: usize,
    /// Base share of the context window per summarization chunk.
    #[serde(default = "d_03")]
    pub base_chunk_ratio: f64,
    /// Floor for the adaptive chunk ratio.
    #[serde(default = "d_005")]
    pub min_chunk_ratio: f64,
    /// Multiplier applied to token estimates when sizing chunks.
    #[serde(default = "d_12")]
    pub safety_margin: f64,
    #[serde(default)]
    pub soft_trim: SoftTrimConfig,
    #[serde(default)]
    pub hard_clear: HardClearConfig,
    #[serde(default)]
    pub tool_pruning: ToolPruningConfig,
}

impl CompactionConfig {
    /// Context window expressed in characters.
    pub fn context_window_chars(&self) -> usize {
        (self.context_window_tokens as f64 * self.chars_per_token) as usize
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context_window_tokens: d_ctx(),
            chars_per_token: 4.0,
            soft_trim_ratio: 0.3,
            hard_clear_ratio: 0.5,
            keep_last_assistants: 3,
            proactive_pruning_ratio: 0.8,
            max_tool_result_context_share: 0.3,
            hard_max_tool_result_chars: d_200k(),
            min_prunable_tool_chars: 2_000,
            base_chunk_ratio: 0.3,
            min_chunk_ratio: 0.05,
            safety_margin: 1.2,
            soft_trim: SoftTrimConfig::default(),
            hard_clear: HardClearConfig::default(),
            tool_pruning: ToolPruningConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftTrimConfig {
    /// Tool results longer than this are soft-trimmed.
    #[serde(default = "d_4000u")]
    pub max_chars: usize,
    /// Chars to keep from the head.
    #[serde(default = "d_1500")]
    pub head_chars: usize,
    /// Chars to keep from the tail.
    #[serde(default = "d_1500")]
    pub tail_chars: usize,
}

impl Default for SoftTrimConfig {
    fn default() -> Self {
        Self {
            max_chars: 4_000,
            head_chars: 1_500,
            tail_chars: 1_500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardClearConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_placeholder")]
    pub placeholder: String,
}

impl Default for HardClearConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            placeholder: d_placeholder(),
        }
    }
}

/// Glob allow/deny lists controlling which tools' results may be pruned.
/// `deny` takes precedence; an empty `allow` list allows everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPruningConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_ctx() -> u64 {
    200_000
}
fn d_4f() -> f64 {
    4.0
}
fn d_03() -> f64 {
    0.3
}
fn d_05() -> f64 {
    0.5
}
fn d_08() -> f64 {
    0.8
}
fn d_005() -> f64 {
    0.05
}
fn d_12() -> f64 {
    1.2
}
fn d_3u() -> usize {
    3
}
fn d_200k() -> usize {
    200_000
}
fn d_2000() -> usize {
    2_000
}
fn d_4000u() -> usize {
    4_000
}
fn d_1500() -> usize {
    1_500
}
fn d_placeholder() -> String {
    "[Old tool result content cleared]".into()
}
