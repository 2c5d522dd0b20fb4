//! Tool-call / tool-result pairing repair.
//!
//! After compaction keeps only a tail of history, a tool result whose
//! originating assistant call was summarized away would be rejected by the
//! provider.  Such orphans are dropped.

use std::collections::HashSet;

use cadence_domain::message::{Message, Role};

pub struct RepairReport {
    pub messages: Vec<Message>,
    pub dropped_orphan_count: usize,
}

/// Drop tool results whose `tool_call_id` does not match a tool call on a
/// preceding assistant message in the same slice.
pub fn repair_tool_pairing(messages: Vec<Message>) -> RepairReport {
    let mut known_ids: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(messages.len());
    let mut dropped = 0;

    for msg in messages {
        match msg.role {
            Role::Assistant => {
                if let Some(calls) = &msg.tool_calls {
                    for tc in calls {
                        known_ids.insert(tc.id.clone());
                    }
                }
                kept.push(msg);
            }
            Role::Tool => {
                let orphan = msg
                    .tool_call_id
                    .as_deref()
                    .map(|id| !known_ids.contains(id))
                    .unwrap_or(true);
                if orphan {
                    dropped += 1;
                } else {
                    kept.push(msg);
                }
            }
            _ => kept.push(msg),
        }
    }

    RepairReport {
        messages: kept,
        dropped_orphan_count: dropped,
    }
}
