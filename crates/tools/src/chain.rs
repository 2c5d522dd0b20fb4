//! Tool chain registry — generic multi-step tool chaining.
//!
//! Chain rules define how one tool's output queues follow-up tool calls.
//! Rules come from MCP metadata, static config, or programmatic
//! registration.  For multi-step chains, a per-session cursor tracks which
//! step each active chain is on.
//!
//! Example — web_search → web_fetch → summarize:
//!
//! ```text
//! ChainRule {
//!     source: "web_search",
//!     steps: [
//!         ChainStep { target: "web_fetch", extract: "results[*].url", arg_mapping: {"url": "$value"} },
//!         ChainStep { target: "summarize", extract: "content",        arg_mapping: {"text": "$value"} },
//!     ],
//! }
//! ```

use std::collections::HashMap;

use parking_lot::RwLock;

use cadence_domain::message::{gen_call_id, Message, ToolCall};

/// A single step in a chain sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStep {
    /// Target tool to invoke.
    pub target: String,
    /// JSONPath expression extracting values from the previous result.
    pub extract: String,
    /// Target parameter names mapped to `"$value"` or literals.
    pub arg_mapping: HashMap<String, String>,
}

/// A multi-step chain starting from a source tool.  After the source
/// executes, step 0 runs on its result; after step 0 executes, step 1 runs
/// on step 0's result, and so on.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainRule {
    pub source: String,
    pub steps: Vec<ChainStep>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ChainRegistry {
    // source tool -> rules
    rules: RwLock<HashMap<String, Vec<ChainRule>>>,
    // session_id -> active (rule, current step index)
    active: RwLock<HashMap<String, Vec<(ChainRule, usize)>>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, rule: ChainRule) {
        self.rules
            .write()
            .entry(rule.source.clone())
            .or_default()
            .push(rule);
    }

    pub fn register_many(&self, rules: Vec<ChainRule>) {
        for rule in rules {
            self.register(rule);
        }
    }

    /// Remove all registered rules (re-discovery starts fresh).
    pub fn clear(&self) {
        self.rules.write().clear();
    }

    /// Remove active chain state for a session.
    pub fn clear_session(&self, session_id: &str) {
        self.active.write().remove(session_id);
    }

    pub fn rule_sources(&self) -> Vec<String> {
        self.rules.read().keys().cloned().collect()
    }

    /// Generate follow-up tool calls from just-executed calls and their
    /// results (same order).  Two sources of chained calls:
    /// 1. New chains: an executed tool matches a rule's source.
    /// 2. Active chains: an executed tool matches an in-progress chain's
    ///    current step target, continuing the sequence.
    ///
    /// Cursor state advances transactionally per session; a chain is
    /// cleared once its final step has been queued.
    pub fn build(
        &self,
        executed_calls: &[ToolCall],
        tool_results: &[Message],
        session_id: Option<&str>,
    ) -> Vec<ToolCall> {
        let mut chained: Vec<ToolCall> = Vec::new();
        let mut new_active: Vec<(ChainRule, usize)> = Vec::new();

        let rules = self.rules.read();

        for (tc, result) in executed_calls.iter().zip(tool_results.iter()) {
            // 1) New chains triggered by this tool.
            if let Some(matching) = rules.get(&tc.name) {
                for rule in matching {
                    let Some(step) = rule.steps.first() else {
                        continue;
                    };
                    for args in extract_chain_args(&result.content, step) {
                        chained.push(ToolCall {
                            id: gen_call_id(),
                            name: step.target.clone(),
                            args,
                        });
                    }
                    if rule.steps.len() > 1 {
                        new_active.push((rule.clone(), 1));
                    }
                }
            }

            // 2) Active chains continuing from this tool.
            if let Some(sid) = session_id {
                let mut active = self.active.write();
                let mut remaining: Vec<(ChainRule, usize)> = Vec::new();

                for (rule, step_idx) in active.remove(sid).unwrap_or_default() {
                    if step_idx >= rule.steps.len() {
                        continue;
                    }
                    let expected_target = if step_idx > 0 {
                        rule.steps[step_idx - 1].target.as_str()
                    } else {
                        rule.source.as_str()
                    };
                    if tc.name != expected_target {
                        remaining.push((rule, step_idx));
                        continue;
                    }
                    let step = &rule.steps[step_idx];
                    for args in extract_chain_args(&result.content, step) {
                        chained.push(ToolCall {
                            id: gen_call_id(),
                            name: step.target.clone(),
                            args,
                        });
                    }
                    if step_idx + 1 < rule.steps.len() {
                        let next = step_idx + 1;
                        new_active.push((rule, next));
                    }
                }

                remaining.append(&mut new_active);
                if remaining.is_empty() {
                    active.remove(sid);
                } else {
                    active.insert(sid.to_string(), remaining);
                }
            }
        }

        // Without a session there is nowhere to track multi-step progress;
        // only first steps fire.
        chained
    }

    #[cfg(test)]
    fn active_count(&self, session_id: &str) -> usize {
        self.active
            .read()
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract chained tool arguments from a JSON result using one chain step.
fn extract_chain_args(result_json: &str, step: &ChainStep) -> Vec<serde_json::Value> {
    let Ok(data) = serde_json::from_str::<serde_json::Value>(result_json) else {
        return Vec::new();
    };

    resolve_jsonpath(&data, &step.extract)
        .into_iter()
        .map(|val| {
            let mut obj = serde_json::Map::new();
            for (param, mapped) in &step.arg_mapping {
                let value = if mapped == "$value" {
                    val.clone()
                } else {
                    serde_json::Value::String(mapped.clone())
                };
                obj.insert(param.clone(), value);
            }
            serde_json::Value::Object(obj)
        })
        .collect()
}

/// Resolve a minimal JSONPath: dot notation with a `[*]` array wildcard.
/// `"results[*].url"` extracts `url` from each element of `results`.
fn resolve_jsonpath(data: &serde_json::Value, path: &str) -> Vec<serde_json::Value> {
    let normalized = path.replace("[*]", ".[*]");
    let mut current: Vec<serde_json::Value> = vec![data.clone()];

    for part in normalized.split('.') {
        if part.is_empty() {
            continue;
        }
        let mut next: Vec<serde_json::Value> = Vec::new();
        for item in current {
            if part == "[*]" {
                if let serde_json::Value::Array(arr) = item {
                    next.extend(arr);
                }
            } else if let serde_json::Value::Object(map) = item {
                if let Some(v) = map.get(part) {
                    next.push(v.clone());
                }
            }
        }
        current = next;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(target: &str, extract: &str, param: &str) -> ChainStep {
        ChainStep {
            target: target.into(),
            extract: extract.into(),
            arg_mapping: HashMap::from([(param.to_string(), "$value".to_string())]),
        }
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: gen_call_id(),
            name: name.into(),
            args: serde_json::json!({}),
        }
    }

    fn result(name: &str, content: &str) -> Message {
        Message::tool_result(gen_call_id(), name, content)
    }

    #[test]
    fn jsonpath_wildcard_extraction() {
        let data = serde_json::json!({
            "results": [
                {"url": "https://a.example", "title": "A"},
                {"url": "https://b.example", "title": "B"}
            ]
        });
        let values = resolve_jsonpath(&data, "results[*].url");
        assert_eq!(
            values,
            vec![
                serde_json::json!("https://a.example"),
                serde_json::json!("https://b.example")
            ]
        );
    }

    #[test]
    fn jsonpath_plain_field() {
        let data = serde_json::json!({"content": "text body"});
        assert_eq!(
            resolve_jsonpath(&data, "content"),
            vec![serde_json::json!("text body")]
        );
    }

    #[test]
    fn single_step_rule_fires_per_extracted_value() {
        let registry = ChainRegistry::new();
        registry.register(ChainRule {
            source: "web_search".into(),
            steps: vec![step("web_fetch", "results[*].url", "url")],
        });

        let results = vec![result(
            "web_search",
            r#"{"results": [{"url": "https://a"}, {"url": "https://b"}]}"#,
        )];
        let chained = registry.build(&[call("web_search")], &results, Some("s1"));

        assert_eq!(chained.len(), 2);
        assert!(chained.iter().all(|c| c.name == "web_fetch"));
        assert_eq!(chained[0].args, serde_json::json!({"url": "https://a"}));
        // Single-step chain leaves no cursor behind.
        assert_eq!(registry.active_count("s1"), 0);
    }

    #[test]
    fn multi_step_chain_advances_cursor() {
        let registry = ChainRegistry::new();
        registry.register(ChainRule {
            source: "web_search".into(),
            steps: vec![
                step("web_fetch", "results[*].url", "url"),
                step("summarize", "content", "text"),
            ],
        });

        // Step 0: source executes.
        let chained = registry.build(
            &[call("web_search")],
            &[result("web_search", r#"{"results": [{"url": "https://a"}]}"#)],
            Some("s1"),
        );
        assert_eq!(chained.len(), 1);
        assert_eq!(chained[0].name, "web_fetch");
        assert_eq!(registry.active_count("s1"), 1);

        // Step 1: the fetched content chains into summarize.
        let chained = registry.build(
            &[call("web_fetch")],
            &[result("web_fetch", r#"{"content": "page text"}"#)],
            Some("s1"),
        );
        assert_eq!(chained.len(), 1);
        assert_eq!(chained[0].name, "summarize");
        assert_eq!(chained[0].args, serde_json::json!({"text": "page text"}));
        // Final step queued — chain cleared.
        assert_eq!(registry.active_count("s1"), 0);
    }

    #[test]
    fn non_matching_tool_leaves_cursor_in_place() {
        let registry = ChainRegistry::new();
        registry.register(ChainRule {
            source: "web_search".into(),
            steps: vec![
                step("web_fetch", "results[*].url", "url"),
                step("summarize", "content", "text"),
            ],
        });

        registry.build(
            &[call("web_search")],
            &[result("web_search", r#"{"results": [{"url": "https://a"}]}"#)],
            Some("s1"),
        );

        // An unrelated tool does not advance the chain.
        let chained = registry.build(
            &[call("bash")],
            &[result("bash", "not json")],
            Some("s1"),
        );
        assert!(chained.is_empty());
        assert_eq!(registry.active_count("s1"), 1);
    }

    #[test]
    fn non_json_result_yields_nothing() {
        let registry = ChainRegistry::new();
        registry.register(ChainRule {
            source: "web_search".into(),
            steps: vec![step("web_fetch", "results[*].url", "url")],
        });
        let chained = registry.build(
            &[call("web_search")],
            &[result("web_search", "plain text, not json")],
            Some("s1"),
        );
        assert!(chained.is_empty());
    }

    #[test]
    fn literal_arg_mapping_passes_through() {
        let registry = ChainRegistry::new();
        let mut mapping = HashMap::new();
        mapping.insert("url".to_string(), "$value".to_string());
        mapping.insert("mode".to_string(), "fast".to_string());
        registry.register(ChainRule {
            source: "web_search".into(),
            steps: vec![ChainStep {
                target: "web_fetch".into(),
                extract: "results[*].url".into(),
                arg_mapping: mapping,
            }],
        });

        let chained = registry.build(
            &[call("web_search")],
            &[result("web_search", r#"{"results": [{"url": "https://a"}]}"#)],
            None,
        );
        assert_eq!(
            chained[0].args,
            serde_json::json!({"url": "https://a", "mode": "fast"})
        );
    }

    #[test]
    fn clear_session_drops_cursor() {
        let registry = ChainRegistry::new();
        registry.register(ChainRule {
            source: "a".into(),
            steps: vec![step("b", "x", "v"), step("c", "y", "v")],
        });
        registry.build(
            &[call("a")],
            &[result("a", r#"{"x": 1}"#)],
            Some("s1"),
        );
        assert_eq!(registry.active_count("s1"), 1);
        registry.clear_session("s1");
        assert_eq!(registry.active_count("s1"), 0);
    }
}
