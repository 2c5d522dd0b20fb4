//! Prompts used by layer-3 compaction.

pub const DEFAULT_SUMMARY_FALLBACK: &str = "No prior history.";

pub const MERGE_INSTRUCTIONS: &str = "Merge these partial summaries into a single cohesive \
     summary. Preserve decisions, TODOs, open questions, and any constraints.";

pub const COMPACTION_SYSTEM_PROMPT: &str = "You are a context summarization assistant. Your task is to read a conversation \
     between a user and an AI assistant, then produce a structured summary following \
     the exact format specified.\n\n\
     Do NOT continue the conversation. Do NOT respond to any questions in the \
     conversation. ONLY output the structured summary.";

const SUMMARY_FORMAT: &str = r#"## Goal
[What is the user trying to accomplish? Can be multiple items if the session covers different tasks.]

## Constraints & Preferences
- [Any constraints, preferences, or requirements mentioned by user]
- [Or "(none)" if none were mentioned]

## Progress
### Done
- [x] [Completed tasks/changes]

### In Progress
- [ ] [Current work]

### Blocked
- [Issues preventing progress, if any]

## Key Decisions
- **[Decision]**: [Brief rationale]

## Next Steps
1. [Ordered list of what should happen next]

## Critical Context
- [Any data, examples, or references needed to continue]
- [Or "(none)" if not applicable]

Keep each section concise. Preserve exact file paths, function names, and error messages."#;

/// Prompt producing a fresh summary.
pub fn compaction_prompt(conversation: &str) -> String {
    format!(
        "<conversation>\n{conversation}\n</conversation>\n\n\
         The messages above are a conversation to summarize. Create a structured \
         context checkpoint summary that another LLM will use to continue the work.\n\n\
         Use this EXACT format:\n\n{SUMMARY_FORMAT}"
    )
}

/// Prompt updating an existing summary incrementally.
pub fn compaction_update_prompt(conversation: &str, previous_summary: &str) -> String {
    format!(
        "<conversation>\n{conversation}\n</conversation>\n\n\
         <previous-summary>\n{previous_summary}\n</previous-summary>\n\n\
         The messages above are NEW conversation messages to incorporate into the \
         existing summary provided in <previous-summary> tags.\n\n\
         Update the existing structured summary with new information. RULES:\n\
         - PRESERVE all existing information from the previous summary\n\
         - ADD new progress, decisions, and context from the new messages\n\
         - UPDATE the Progress section: move items from \"In Progress\" to \"Done\" when completed\n\
         - UPDATE \"Next Steps\" based on what was accomplished\n\
         - PRESERVE exact file paths, function names, and error messages\n\
         - If something is no longer relevant, you may remove it\n\n\
         Use this EXACT format:\n\n{SUMMARY_FORMAT}"
    )
}
