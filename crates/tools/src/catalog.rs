//! The tool descriptor catalog.
//!
//! Built-in descriptors are static; MCP-discovered descriptors are merged
//! in at discovery time.  Client-side tools execute on the caller — the
//! server records a placeholder result and defers the call.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde_json::json;

use cadence_domain::message::ToolSchema;

/// One tool the model may invoke.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub schema: ToolSchema,
    /// Executed on the caller; the server defers and waits for the result
    /// in a follow-up turn.
    pub client_side: bool,
    /// Execution is gated behind user approval.
    pub requires_approval: bool,
}

impl ToolDescriptor {
    pub fn server(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            schema: ToolSchema {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            client_side: false,
            requires_approval: false,
        }
    }

    pub fn client(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            client_side: true,
            ..Self::server(name, description, parameters)
        }
    }
}

/// Agent-internal tools, always available to the model.
pub const AGENT_TOOLS: &[&str] = &["manage_todo", "manage_periodic_task", "notify_user"];

/// Session-file tools, proxied server-side to the storage service.
pub const SESSION_FILE_TOOLS: &[&str] = &["read_file", "write_file", "list_files", "delete_file"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolCatalog {
    builtin: RwLock<HashMap<String, ToolDescriptor>>,
    external: RwLock<HashMap<String, ToolDescriptor>>,
    approval_required: RwLock<HashSet<String>>,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCatalog {
    pub fn new() -> Self {
        let builtin = builtin_descriptors()
            .into_iter()
            .map(|d| (d.schema.name.clone(), d))
            .collect();
        Self {
            builtin: RwLock::new(builtin),
            external: RwLock::new(HashMap::new()),
            approval_required: RwLock::new(HashSet::new()),
        }
    }

    /// Replace or add a built-in descriptor.  Admin updates use this to
    /// re-home a tool (e.g. give `bash` a server-side executor).
    pub fn upsert_builtin(&self, descriptor: ToolDescriptor) {
        if descriptor.requires_approval {
            self.approval_required
                .write()
                .insert(descriptor.schema.name.clone());
        }
        self.builtin
            .write()
            .insert(descriptor.schema.name.clone(), descriptor);
    }

    /// Replace the external (MCP-discovered) descriptor set.
    pub fn set_external(&self, descriptors: Vec<ToolDescriptor>) {
        let mut approval = self.approval_required.write();
        let mut external = self.external.write();
        external.clear();
        for d in descriptors {
            if d.requires_approval {
                approval.insert(d.schema.name.clone());
            }
            external.insert(d.schema.name.clone(), d);
        }
    }

    /// Names of all externally discovered tools.
    pub fn external_names(&self) -> Vec<String> {
        self.external.read().keys().cloned().collect()
    }

    /// Schemas of all externally discovered tools.
    pub fn external_schemas(&self) -> Vec<ToolSchema> {
        self.external.read().values().map(|d| d.schema.clone()).collect()
    }

    pub fn is_external(&self, name: &str) -> bool {
        self.external.read().contains_key(name)
    }

    /// Resolve names to schemas, skipping unknown names.  External
    /// descriptors are always appended so the model sees everything
    /// discovered.
    pub fn resolve(&self, names: &[String]) -> Vec<ToolSchema> {
        let mut out: Vec<ToolSchema> = Vec::new();
        let builtin = self.builtin.read();
        let external = self.external.read();
        for name in names {
            if let Some(d) = builtin.get(name) {
                out.push(d.schema.clone());
            } else if let Some(d) = external.get(name) {
                out.push(d.schema.clone());
            }
        }
        for (name, d) in external.iter() {
            if !names.contains(name) {
                out.push(d.schema.clone());
            }
        }
        out
    }

    /// Client-side tools are a fixed set of builtins; everything else is
    /// server-side.
    pub fn is_client_side(&self, name: &str) -> bool {
        self.builtin.read().get(name).is_some_and(|d| d.client_side)
    }

    pub fn is_server_side(&self, name: &str) -> bool {
        !self.is_client_side(name)
    }

    /// Whether a tool carries the approval-required flag (before any
    /// per-session auto-approval is taken into account).
    pub fn requires_approval(&self, name: &str) -> bool {
        self.approval_required.read().contains(name)
    }

    /// Mark a tool approval-required (admin updates and tests).
    pub fn mark_approval_required(&self, name: &str) {
        self.approval_required.write().insert(name.to_string());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn builtin_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::client(
            "bash",
            "Execute a bash command on the user's machine. Use this when the user asks you to \
             run commands, check files, list directories, or perform any system operation.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The bash command to execute" }
                },
                "required": ["command"]
            }),
        ),
        ToolDescriptor::client(
            "ask_question",
            "Ask the user a multiple-choice question when you need clarification or when the \
             user needs to make a decision before proceeding. Present clear choices and \
             optionally allow free-text input.",
            json!({
                "type": "object",
                "properties": {
                    "question": { "type": "string", "description": "The question to ask the user" },
                    "choices": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "List of choices the user can select from"
                    },
                    "allow_user_input": {
                        "type": "boolean",
                        "description": "Whether to allow a custom typed answer",
                        "default": false
                    }
                },
                "required": ["question", "choices"]
            }),
        ),
        ToolDescriptor::client(
            "select_cwd",
            "Open a folder picker dialog to let the user select a working directory for \
             subsequent bash commands.",
            json!({ "type": "object", "properties": {} }),
        ),
        ToolDescriptor::client(
            "browser_navigate",
            "Navigate the user's current browser tab to a URL. Returns the page title, URL, \
             interactive elements with CSS selectors, and visible text.",
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "The URL to navigate to (must include http:// or https://)" }
                },
                "required": ["url"]
            }),
        ),
        ToolDescriptor::client(
            "browser_new_tab",
            "Open a URL in a new browser tab without affecting the user's current tab. \
             Returns page content.",
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "The URL to open in a new tab" }
                },
                "required": ["url"]
            }),
        ),
        ToolDescriptor::client(
            "browser_click",
            "Click an element on the current browser page. Use a CSS selector from \
             browser_get_content. Returns updated page content after the click.",
            json!({
                "type": "object",
                "properties": {
                    "selector": { "type": "string", "description": "CSS selector of the element to click" }
                },
                "required": ["selector"]
            }),
        ),
        ToolDescriptor::client(
            "browser_type",
            "Type text into an input field on the current browser page.",
            json!({
                "type": "object",
                "properties": {
                    "selector": { "type": "string", "description": "CSS selector of the input element" },
                    "text": { "type": "string", "description": "The text to type" }
                },
                "required": ["selector", "text"]
            }),
        ),
        ToolDescriptor::client(
            "browser_get_content",
            "Get the current browser page content: title, URL, interactive elements with CSS \
             selectors, and visible text. Always call this before clicking or typing.",
            json!({ "type": "object", "properties": {} }),
        ),
        ToolDescriptor::server(
            "read_file",
            "Read a file from the session's cloud file storage.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File path within the session (e.g. 'notes/todo.md')" }
                },
                "required": ["path"]
            }),
        ),
        ToolDescriptor::server(
            "write_file",
            "Write or create a file in the session's cloud file storage. Creates the file if \
             it doesn't exist, or overwrites if it does.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File path within the session" },
                    "content": { "type": "string", "description": "Text content to write" }
                },
                "required": ["path", "content"]
            }),
        ),
        ToolDescriptor::server(
            "list_files",
            "List all files in the session's cloud file storage, optionally filtered by \
             directory path.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Optional directory prefix to filter" }
                }
            }),
        ),
        ToolDescriptor::server(
            "delete_file",
            "Delete a file from the session's cloud file storage.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File path to delete" }
                },
                "required": ["path"]
            }),
        ),
        ToolDescriptor::server(
            "manage_todo",
            "Create or update a TODO execution plan for the current task. Use this for \
             multi-step tasks to plan before executing.",
            json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["create", "update_step", "add_steps"],
                        "description": "Action to perform"
                    },
                    "task": { "type": "string", "description": "Overall task description (required for 'create')" },
                    "steps": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Step descriptions (required for 'create' and 'add_steps')"
                    },
                    "step_index": { "type": "integer", "description": "Index of step to update (required for 'update_step')" },
                    "status": {
                        "type": "string",
                        "enum": ["in_progress", "completed", "failed"],
                        "description": "New status for the step (required for 'update_step')"
                    },
                    "result": { "type": "string", "description": "Brief result description for completed/failed steps" },
                    "after_index": { "type": "integer", "description": "Insert new steps after this index (for 'add_steps')" }
                },
                "required": ["action"]
            }),
        ),
        ToolDescriptor::server(
            "manage_periodic_task",
            "Register, list, or manage periodic (scheduled) tasks. Use this after successfully \
             completing a dry run of a repeating task to register it as a periodic task that \
             runs automatically on schedule.",
            json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["register", "list", "cancel", "pause", "resume"],
                        "description": "Action to perform on periodic tasks"
                    },
                    "title": { "type": "string", "description": "Short title for the periodic task (required for 'register')" },
                    "description": { "type": "string", "description": "Longer description of what the task does" },
                    "recipe": {
                        "type": "object",
                        "description": "Execution recipe learned from the dry run (required for 'register'). Must include: objective, instructions (array), output_spec."
                    },
                    "schedule": {
                        "type": "object",
                        "description": "Schedule specification (required for 'register'). Example: {\"type\": \"cron\", \"cron\": {\"minute\": 0, \"hour\": 9, \"day_of_month\": \"*\", \"month\": \"*\", \"day_of_week\": \"*\"}}"
                    },
                    "timezone": { "type": "string", "description": "IANA timezone for the schedule" },
                    "task_id": { "type": "string", "description": "ID of the periodic task (required for 'cancel', 'pause', 'resume')" },
                    "notify_on_success": {
                        "type": "boolean",
                        "description": "Whether to send a notification when the task completes successfully. Default: true."
                    }
                },
                "required": ["action"]
            }),
        ),
        ToolDescriptor::server(
            "notify_user",
            "Send a push notification to the user. Use this to deliver results, alerts, or \
             updates directly to the user's devices. Periodic tasks MUST call this at the end \
             to report their results.",
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Notification title (short, descriptive)" },
                    "body": { "type": "string", "description": "Notification body with the detailed message or results" }
                },
                "required": ["title", "body"]
            }),
        ),
    ]
}
