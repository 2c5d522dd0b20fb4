use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider & pricing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible completions endpoint.
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    /// Default model identifier.
    #[serde(default = "d_model")]
    pub model: String,
    /// Sampling temperature.
    #[serde(default = "d_temp")]
    pub temperature: f32,
    /// Maximum tokens per completion (None lets the provider choose).
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    /// Per-call timeout in seconds.
    #[serde(default = "d_300")]
    pub request_timeout_secs: u64,
    /// Per-model pricing for cost computation (key = model name).
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            api_key_env: d_api_key_env(),
            model: d_model(),
            temperature: d_temp(),
            max_output_tokens: None,
            request_timeout_secs: 300,
            pricing: HashMap::new(),
        }
    }
}

/// USD cost per million tokens for one model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_mtok: f64,
    pub output_cost_per_mtok: f64,
}

impl ModelPricing {
    /// Estimated cost in USD for a token count pair.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_cost_per_mtok
            + output_tokens as f64 * self.output_cost_per_mtok)
            / 1_000_000.0
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn d_model() -> String {
    "gpt-4o".into()
}
fn d_temp() -> f32 {
    0.2
}
fn d_300() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_estimate() {
        let pricing = ModelPricing {
            input_cost_per_mtok: 3.0,
            output_cost_per_mtok: 15.0,
        };
        let cost = pricing.estimate_cost(1_000_000, 200_000);
        assert!((cost - 6.0).abs() < 1e-9);
    }

    #[test]
    fn pricing_zero_tokens() {
        let pricing = ModelPricing {
            input_cost_per_mtok: 3.0,
            output_cost_per_mtok: 15.0,
        };
        assert_eq!(pricing.estimate_cost(0, 0), 0.0);
    }
}
