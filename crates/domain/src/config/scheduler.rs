use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Periodic task scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between beat steps that scan for due tasks.
    #[serde(default = "d_60")]
    pub beat_interval_secs: u64,
    /// Size of the worker pool executing due tasks.
    #[serde(default = "d_4")]
    pub workers: usize,
    /// Attempts per run before the run is marked failed.
    #[serde(default = "d_3")]
    pub max_retries: u32,
    /// Base delay for the retry backoff `base · 2^(attempt-1)`, in seconds.
    #[serde(default = "d_60")]
    pub retry_base_delay_secs: u64,
    /// Soft timeout per run in seconds.
    #[serde(default = "d_300")]
    pub soft_timeout_secs: u64,
    /// Hard timeout per run in seconds; the run is marked failed past this.
    #[serde(default = "d_360")]
    pub hard_timeout_secs: u64,
    /// Timezone applied when a task doesn't name one.
    #[serde(default = "d_tz")]
    pub default_timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            beat_interval_secs: 60,
            workers: 4,
            max_retries: 3,
            retry_base_delay_secs: 60,
            soft_timeout_secs: 300,
            hard_timeout_secs: 360,
            default_timezone: d_tz(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_60() -> u64 {
    60
}
fn d_4() -> usize {
    4
}
fn d_3() -> u32 {
    3
}
fn d_300() -> u64 {
    300
}
fn d_360() -> u64 {
    360
}
fn d_tz() -> String {
    "Asia/Seoul".into()
}
