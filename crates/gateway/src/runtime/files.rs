//! Session-file tools, proxied to the platform storage service.
//!
//! Failures come back as error strings in the tool result — a storage
//! hiccup never terminates the turn.

use serde_json::Value;

use cadence_domain::config::PlatformConfig;

pub struct SessionFileClient {
    base_url: String,
    client: reqwest::Client,
}

impl SessionFileClient {
    pub fn new(cfg: &PlatformConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn files_url(&self, session_id: &str, suffix: &str) -> String {
        format!(
            "{}/api/v1/sessions/{session_id}/files{suffix}",
            self.base_url
        )
    }

    /// Execute one of the session-file tools by name.
    pub async fn execute(&self, name: &str, args: &Value, session_id: &str) -> String {
        let path = args.get("path").and_then(|p| p.as_str()).unwrap_or("");
        match name {
            "read_file" => self.read_file(session_id, path).await,
            "write_file" => {
                let content = args.get("content").and_then(|c| c.as_str()).unwrap_or("");
                self.write_file(session_id, path, content).await
            }
            "list_files" => self.list_files(session_id, path).await,
            "delete_file" => self.delete_file(session_id, path).await,
            other => format!("Unknown session file tool: {other}"),
        }
    }

    async fn read_file(&self, session_id: &str, path: &str) -> String {
        let resp = self
            .client
            .get(self.files_url(session_id, "/read/"))
            .query(&[("path", path)])
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => {
                let body: Value = r.json().await.unwrap_or(Value::Null);
                body.get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or("(no content)")
                    .to_string()
            }
            Ok(r) => format!("Error: {}", error_body(r).await),
            Err(e) => format!("Error reading file: {e}"),
        }
    }

    pub async fn write_file(&self, session_id: &str, path: &str, content: &str) -> String {
        let resp = self
            .client
            .post(self.files_url(session_id, "/write/"))
            .json(&serde_json::json!({
                "path": path,
                "content": content,
                "created_by": "agent",
            }))
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => format!("File written: {path}"),
            Ok(r) => format!("Error writing file: {}", error_body(r).await),
            Err(e) => format!("Error writing file: {e}"),
        }
    }

    async fn list_files(&self, session_id: &str, path: &str) -> String {
        let mut req = self.client.get(self.files_url(session_id, "/"));
        if !path.is_empty() {
            req = req.query(&[("path", path)]);
        }
        match req.send().await {
            Ok(r) if r.status().is_success() => {
                let files: Vec<Value> = r.json().await.unwrap_or_default();
                if files.is_empty() {
                    return "No files in session.".into();
                }
                files
                    .iter()
                    .map(|f| {
                        format!(
                            "- {} ({} bytes, {})",
                            f.get("path").and_then(|v| v.as_str()).unwrap_or("?"),
                            f.get("size").and_then(|v| v.as_u64()).unwrap_or(0),
                            f.get("content_type").and_then(|v| v.as_str()).unwrap_or("?"),
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Ok(r) => format!("Error listing files: {}", error_body(r).await),
            Err(e) => format!("Error listing files: {e}"),
        }
    }

    async fn delete_file(&self, session_id: &str, path: &str) -> String {
        let resp = self
            .client
            .delete(self.files_url(session_id, "/delete-by-path/"))
            .query(&[("path", path)])
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => format!("File deleted: {path}"),
            Ok(r) => format!("Error deleting file: {}", error_body(r).await),
            Err(e) => format!("Error deleting file: {e}"),
        }
    }
}

async fn error_body(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<Value>().await {
        Ok(body) => body
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {status}")),
        Err(_) => format!("HTTP {status}"),
    }
}
