//! System prompt assembly.
//!
//! The system prompt is never stored in history — it is rebuilt fresh for
//! every LLM call so tool availability and instructions stay current.

use cadence_domain::message::ToolSchema;

const IDENTITY: &str = "You are Cadence, a capable assistant that completes tasks for the user by \
     reasoning step by step and calling tools when they help. Be direct and \
     concise. Prefer doing over asking; only ask a question when a decision \
     genuinely blocks progress.";

const FILE_GUIDE: &str = "<file_guide>
Session file storage is available through these tools:
- **read_file**: Read a file by path.
- **write_file**: Create or overwrite a file.
- **list_files**: List files, optionally under a directory prefix.
- **delete_file**: Delete a file by path.

Files persist across the session and are accessible to the user through the
file panel. Use these tools when the user asks you to save, create, read, or
manage files.
</file_guide>";

const TODO_GUIDE: &str = "<todo_guide>
For multi-step tasks, call manage_todo to create an execution plan before
acting, then update each step as you complete it. Keep the plan current —
the user watches it for progress.
</todo_guide>";

const PERIODIC_GUIDE: &str = "<periodic_task_guide>
When the user asks for something to happen on a schedule, first perform one
successful dry run of the task, then call manage_periodic_task with
action=\"register\", the learned recipe, and the schedule. Never register a
task whose dry run failed.
</periodic_task_guide>";

/// Build the full system prompt for one LLM call.
///
/// `tool_names` are the resolved tools for this turn; `external_tools` are
/// the MCP-discovered schemas (listed so the model knows what exists even
/// before binding).  `instructions` lands in a trailing block.
pub fn build_system_prompt(
    tool_names: &[String],
    external_tools: &[ToolSchema],
    instructions: Option<&str>,
) -> String {
    let mut prompt = String::from(IDENTITY);

    if !tool_names.is_empty() {
        prompt.push_str("\n\nTools available this turn: ");
        prompt.push_str(&tool_names.join(", "));
        prompt.push('.');
    }

    if !external_tools.is_empty() {
        prompt.push_str("\n\n<discovered_tools>\n");
        for tool in external_tools {
            prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }
        prompt.push_str("</discovered_tools>");
    }

    prompt.push_str("\n\n");
    prompt.push_str(FILE_GUIDE);
    prompt.push_str("\n\n");
    prompt.push_str(TODO_GUIDE);
    prompt.push_str("\n\n");
    prompt.push_str(PERIODIC_GUIDE);

    if let Some(extra) = instructions {
        if !extra.is_empty() {
            prompt.push_str(&format!("\n\n<instructions>\n{extra}\n</instructions>"));
        }
    }

    prompt
}

/// Directive for scheduler-initiated turns: no user is present.
pub const HEADLESS_INSTRUCTIONS: &str = "You are running a scheduled periodic task in headless mode. There is no user \
     present — do NOT use ask_question. Execute the task according to the \
     instructions in the user message. You MUST call notify_user at the end to \
     send results to the user. If you encounter an error, try to recover. If \
     recovery fails, call notify_user to inform the user what went wrong.";
