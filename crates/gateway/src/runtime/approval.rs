//! Approval gate — parks sensitive tool calls behind a user decision.
//!
//! When a server-side batch contains an approval-required tool, the runner
//! emits one synthetic `ask_question` call and stores the batch as a
//! [`PendingApproval`].  The next turn's answer (a tool message whose
//! `tool_call_id` is the approval call id) resumes or denies it.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use cadence_domain::message::{gen_call_id, Message, Role, ToolCall, Usage};
use cadence_tools::ToolCatalog;

/// Decoded user decision.  Anything unrecognized is a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    AllowOnce,
    AlwaysAllow,
    Deny,
}

impl ApprovalDecision {
    pub const CHOICES: [&'static str; 3] = ["Allow Once", "Always Allow", "Deny"];

    pub fn parse(answer: &str) -> Self {
        match answer.trim() {
            "Allow Once" => Self::AllowOnce,
            "Always Allow" => Self::AlwaysAllow,
            _ => Self::Deny,
        }
    }

    pub fn allows_execution(self) -> bool {
        matches!(self, Self::AllowOnce | Self::AlwaysAllow)
    }
}

/// A parked tool batch, singleton per session.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub approval_call_id: String,
    pub tool_calls: Vec<ToolCall>,
    pub saved_input_messages: Vec<Message>,
    pub saved_usage: Option<Usage>,
    /// The assistant message that decided the calls, raw metadata intact.
    pub saved_assistant: Option<Message>,
    /// Chain follow-ups queued behind the gated batch.
    pub remaining_chained: Vec<ToolCall>,
}

/// Result of consuming an approval answer.
pub struct ApprovalResume {
    pub decision: ApprovalDecision,
    pub pending: PendingApproval,
    /// Input messages with the consumed answer stripped.
    pub filtered_messages: Vec<Message>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, PendingApproval>>,
    auto_approved: Mutex<HashMap<String, HashSet<String>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a tool still requires approval for this session — flagged
    /// by the catalog and not yet auto-approved.
    pub fn needs_approval(&self, catalog: &ToolCatalog, name: &str, session_id: &str) -> bool {
        if !catalog.requires_approval(name) {
            return false;
        }
        !self
            .auto_approved
            .lock()
            .get(session_id)
            .is_some_and(|set| set.contains(name))
    }

    pub fn has_pending(&self, session_id: &str) -> bool {
        self.pending.lock().contains_key(session_id)
    }

    /// Park a batch and build the synthetic `ask_question` payload.
    /// Returns (approval_call_id, question arguments).
    pub fn request_approval(
        &self,
        catalog: &ToolCatalog,
        session_id: &str,
        server_calls: Vec<ToolCall>,
        saved_input_messages: Vec<Message>,
        saved_usage: Option<Usage>,
        saved_assistant: Option<Message>,
        remaining_chained: Vec<ToolCall>,
    ) -> (String, serde_json::Value) {
        let approval_call_id = gen_call_id();
        let gated: Vec<&ToolCall> = server_calls
            .iter()
            .filter(|tc| self.needs_approval(catalog, &tc.name, session_id))
            .collect();
        let question = format_question(&gated);

        self.pending.lock().insert(
            session_id.to_string(),
            PendingApproval {
                approval_call_id: approval_call_id.clone(),
                tool_calls: server_calls,
                saved_input_messages,
                saved_usage,
                saved_assistant,
                remaining_chained,
            },
        );

        (approval_call_id, question)
    }

    /// Consume the pending approval if `messages` carries its answer.
    /// Without an answer, the pending state is restored untouched so a
    /// later turn can still resolve it.  Exactly one resume consumes a
    /// given approval.
    pub fn handle_response(
        &self,
        session_id: &str,
        messages: &[Message],
    ) -> Option<ApprovalResume> {
        let pending = self.pending.lock().remove(session_id)?;

        let Some(answer) = extract_answer(messages, &pending.approval_call_id) else {
            self.pending
                .lock()
                .insert(session_id.to_string(), pending);
            return None;
        };

        let decision = ApprovalDecision::parse(&answer);

        if decision == ApprovalDecision::AlwaysAllow {
            let mut auto = self.auto_approved.lock();
            let set = auto.entry(session_id.to_string()).or_default();
            for tc in &pending.tool_calls {
                set.insert(tc.name.clone());
            }
        }

        let filtered = messages
            .iter()
            .filter(|m| {
                !(m.role == Role::Tool
                    && m.tool_call_id.as_deref() == Some(&pending.approval_call_id))
            })
            .cloned()
            .collect();

        Some(ApprovalResume {
            decision,
            pending,
            filtered_messages: filtered,
        })
    }

    /// Session tool names currently auto-approved (for assertions and
    /// admin introspection).
    pub fn auto_approved(&self, session_id: &str) -> HashSet<String> {
        self.auto_approved
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_session(&self, session_id: &str) {
        self.pending.lock().remove(session_id);
        self.auto_approved.lock().remove(session_id);
    }
}

/// Build the `ask_question` arguments describing the gated tools.
fn format_question(gated: &[&ToolCall]) -> serde_json::Value {
    let question = if gated.len() == 1 {
        format!("Allow {}({})?", gated[0].name, gated[0].args)
    } else {
        let lines: Vec<String> = gated
            .iter()
            .map(|tc| format!("  - {}({})", tc.name, tc.args))
            .collect();
        format!("Allow the following tool executions?\n{}", lines.join("\n"))
    };
    serde_json::json!({
        "question": question,
        "choices": ApprovalDecision::CHOICES,
    })
}

/// Find the answer to an approval question, stripping the client display
/// prefixes.
fn extract_answer(messages: &[Message], approval_call_id: &str) -> Option<String> {
    for msg in messages {
        if msg.role == Role::Tool && msg.tool_call_id.as_deref() == Some(approval_call_id) {
            let content = msg.content.as_str();
            if let Some(rest) = content.strip_prefix("User chose: ") {
                return Some(rest.to_string());
            }
            if let Some(rest) = content.strip_prefix("User input: ") {
                return Some(rest.to_string());
            }
            return Some(content.to_string());
        }
    }
    None
}
