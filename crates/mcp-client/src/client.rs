//! The MCP client: discovery with a TTL cache, and tool dispatch.
//!
//! Transport is streamable HTTP: every JSON-RPC request is POSTed to
//! `{base_url}/mcp`.  A failed server is skipped at discovery time and its
//! session re-initialized on the next call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;

use cadence_domain::config::McpConfig;
use cadence_domain::error::{Error, Result};

use crate::protocol::{
    extract_call_text, initialize_params, ChainMeta, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ToolsListResult,
};

/// One tool discovered from an MCP server, with decoded metadata.
#[derive(Debug, Clone)]
pub struct DiscoveredTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub requires_approval: bool,
    pub chain: Vec<ChainMeta>,
}

struct DiscoveryCache {
    tools: Vec<DiscoveredTool>,
    fetched_at: Instant,
}

pub struct McpClient {
    server_urls: Vec<String>,
    cache_ttl: Duration,
    client: reqwest::Client,
    next_id: AtomicU64,
    cache: RwLock<Option<DiscoveryCache>>,
    // tool name -> server base URL
    tool_to_server: RwLock<HashMap<String, String>>,
}

impl McpClient {
    pub fn new(cfg: &McpConfig) -> Self {
        Self {
            server_urls: cfg.server_urls.clone(),
            cache_ttl: Duration::from_secs(cfg.tool_cache_ttl_secs),
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            cache: RwLock::new(None),
            tool_to_server: RwLock::new(HashMap::new()),
        }
    }

    /// Discover tools from all configured servers, returning cached
    /// results while the TTL holds.  A server that fails to answer is
    /// logged and skipped.
    pub async fn discover_tools(&self) -> Vec<DiscoveredTool> {
        {
            let cache = self.cache.read();
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return cached.tools.clone();
                }
            }
        }

        let mut tools: Vec<DiscoveredTool> = Vec::new();
        let mut mapping: HashMap<String, String> = HashMap::new();

        for url in &self.server_urls {
            match self.list_server_tools(url).await {
                Ok(server_tools) => {
                    tracing::info!(
                        server = %url,
                        count = server_tools.len(),
                        "discovered MCP tools"
                    );
                    for tool in server_tools {
                        mapping.insert(tool.name.clone(), url.clone());
                        tools.push(tool);
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %url, error = %e, "MCP server unavailable");
                }
            }
        }

        *self.tool_to_server.write() = mapping;
        *self.cache.write() = Some(DiscoveryCache {
            tools: tools.clone(),
            fetched_at: Instant::now(),
        });
        tools
    }

    /// Force re-discovery on the next call.
    pub fn invalidate_cache(&self) {
        *self.cache.write() = None;
    }

    /// Whether a tool was discovered from any server.
    pub fn is_server_tool(&self, name: &str) -> bool {
        self.tool_to_server.read().contains_key(name)
    }

    /// Call a tool on its server, returning the result as text.  Failures
    /// come back as an error string that guides the model to retry — a
    /// tool failure never terminates the turn.
    pub async fn call_tool(&self, name: &str, arguments: &Value) -> String {
        let Some(url) = self.tool_to_server.read().get(name).cloned() else {
            return format!("Error: tool '{name}' not found on any MCP server");
        };

        let params = serde_json::json!({ "name": name, "arguments": arguments });
        match self.request(&url, "tools/call", Some(params)).await {
            Ok(result) => extract_call_text(&result),
            Err(e) => {
                tracing::warn!(tool = name, server = %url, error = %e, "tool call failed");
                format!(
                    "Error calling {name}: {e}. The tool call failed — you may retry with the \
                     same or modified arguments."
                )
            }
        }
    }

    // ── Internal ──────────────────────────────────────────────────

    async fn list_server_tools(&self, url: &str) -> Result<Vec<DiscoveredTool>> {
        // Handshake: initialize, then notifications/initialized.
        self.request(url, "initialize", Some(initialize_params()))
            .await?;
        self.notify(url, "notifications/initialized").await?;

        let result = self.request(url, "tools/list", None).await?;
        let listed: ToolsListResult = serde_json::from_value(result)?;

        Ok(listed.tools.into_iter().map(decode_tool).collect())
    }

    async fn request(&self, url: &str, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let resp = self
            .client
            .post(format!("{}/mcp", url.trim_end_matches('/')))
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Http(format!("HTTP {} - {}", status.as_u16(), text)));
        }

        let rpc: JsonRpcResponse = serde_json::from_str(&text)?;
        rpc.into_result()
            .map_err(|e| Error::Http(format!("{method}: {e}")))
    }

    async fn notify(&self, url: &str, method: &str) -> Result<()> {
        let note = JsonRpcNotification::new(method);
        self.client
            .post(format!("{}/mcp", url.trim_end_matches('/')))
            .json(&note)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(())
    }
}

/// Decode an MCP tool definition, pulling chain rules and the approval
/// flag out of `_meta`.
fn decode_tool(def: crate::protocol::McpToolDef) -> DiscoveredTool {
    let meta = def.meta.unwrap_or(Value::Null);
    let requires_approval = meta
        .get("requires_approval")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let chain: Vec<ChainMeta> = meta
        .get("chain")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    DiscoveredTool {
        name: def.name,
        description: def.description.unwrap_or_default(),
        parameters: def
            .input_schema
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        requires_approval,
        chain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::McpToolDef;

    #[test]
    fn decode_tool_reads_meta() {
        let def: McpToolDef = serde_json::from_value(serde_json::json!({
            "name": "web_search",
            "description": "Search",
            "inputSchema": {"type": "object"},
            "_meta": {
                "requires_approval": true,
                "chain": [
                    {"target": "web_fetch", "extract": "results[*].url",
                     "arg_mapping": {"url": "$value"}}
                ]
            }
        }))
        .unwrap();
        let tool = decode_tool(def);
        assert!(tool.requires_approval);
        assert_eq!(tool.chain.len(), 1);
        assert_eq!(tool.chain[0].target, "web_fetch");
    }

    #[test]
    fn decode_tool_defaults() {
        let def: McpToolDef =
            serde_json::from_value(serde_json::json!({"name": "plain"})).unwrap();
        let tool = decode_tool(def);
        assert!(!tool.requires_approval);
        assert!(tool.chain.is_empty());
        assert_eq!(tool.parameters["type"], "object");
    }

    #[test]
    fn unknown_tool_call_returns_error_string() {
        let client = McpClient::new(&McpConfig::default());
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let out = rt.block_on(client.call_tool("ghost", &serde_json::json!({})));
        assert!(out.starts_with("Error: tool 'ghost' not found"));
    }
}
