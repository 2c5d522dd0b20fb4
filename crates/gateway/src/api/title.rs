//! `POST /v1/title` — short conversation title generation.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use cadence_domain::message::Message;
use cadence_providers::ChatRequest;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TitleRequest {
    #[serde(default)]
    pub messages: Vec<TitleMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TitleMessage {
    pub role: String,
    #[serde(default)]
    pub text: String,
}

pub async fn generate_title(
    State(state): State<AppState>,
    Json(body): Json<TitleRequest>,
) -> impl IntoResponse {
    if body.messages.is_empty() {
        return Json(serde_json::json!({"title": "New Chat"}));
    }

    let conversation: String = body
        .messages
        .iter()
        .filter(|m| !m.text.is_empty())
        .map(|m| {
            let mut role = m.role.clone();
            if let Some(first) = role.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            format!("{role}: {}", m.text)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Generate a very short title (max 6 words) for this conversation. \
         Return ONLY the title, no quotes or punctuation.\n\n{conversation}"
    );

    let req = ChatRequest {
        messages: vec![Message::user(prompt)],
        tools: vec![],
        temperature: Some(0.2),
        max_tokens: Some(32),
        model: None,
    };

    let title = match state.provider.chat(&req).await {
        Ok(resp) => {
            let t = resp.content.trim().trim_matches(['"', '\'']).to_string();
            clip(&t, 60)
        }
        Err(e) => {
            tracing::warn!(error = %e, "title generation failed");
            // Fallback: first user message.
            let first = body
                .messages
                .iter()
                .find(|m| m.role == "user")
                .map(|m| m.text.clone())
                .unwrap_or_else(|| "New Chat".into());
            clip(&first, 60)
        }
    };

    Json(serde_json::json!({"title": title}))
}

fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max.saturating_sub(3);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
