//! Push notification delivery through the platform service.

use serde_json::Value;

use cadence_domain::config::PlatformConfig;

pub struct NotificationClient {
    base_url: String,
    client: reqwest::Client,
}

impl NotificationClient {
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

    /// Execute the `notify_user` tool.
    pub async fn execute(&self, args: &Value, session_id: &str) -> String {
        let title = args.get("title").and_then(|t| t.as_str()).unwrap_or("");
        let body = args.get("body").and_then(|b| b.as_str()).unwrap_or("");
        if title.is_empty() || body.is_empty() {
            return "Error: title and body are required".into();
        }
        self.send(session_id, title, body, None).await
    }

    /// Send a notification.  `data` carries structured metadata (periodic
    /// run outcomes and the like).
    pub async fn send(
        &self,
        session_id: &str,
        title: &str,
        body: &str,
        data: Option<Value>,
    ) -> String {
        let payload = serde_json::json!({
            "session_id": session_id,
            "title": title,
            "body": body,
            "data": data.unwrap_or(Value::Null),
        });

        let resp = self
            .client
            .post(format!("{}/api/v1/notifications/send/", self.base_url))
            .json(&payload)
            .send()
            .await;

        match resp {
            Ok(r) if r.status().is_success() => format!("Notification sent: {title}"),
            Ok(r) => {
                let status = r.status();
                tracing::warn!(%status, "notification delivery failed");
                format!("Error sending notification: HTTP {status}")
            }
            Err(e) => {
                tracing::warn!(error = %e, "notification delivery failed");
                format!("Error sending notification: {e}")
            }
        }
    }
}
