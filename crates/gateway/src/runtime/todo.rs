//! TODO service — per-session execution plans.
//!
//! The model creates a plan for multi-step tasks via `manage_todo`, then
//! updates step status as it works.  The compact state prompt is injected
//! into instructions every tool iteration; the rendered markdown is
//! persisted to session files so the user can watch progress.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct TodoStep {
    pub description: String,
    pub status: String, // pending | in_progress | completed | failed
    pub result: Option<String>,
}

impl TodoStep {
    fn new(description: String) -> Self {
        Self {
            description,
            status: "pending".into(),
            result: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionTodo {
    pub task: String,
    pub steps: Vec<TodoStep>,
    pub filename: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct TodoService {
    todos: Mutex<HashMap<String, SessionTodo>>,
    history: Mutex<HashMap<String, Vec<SessionTodo>>>,
}

impl TodoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch a `manage_todo` call by action.  Errors come back as tool
    /// result strings for the model to read.
    pub fn execute(&self, args: &Value, session_id: &str) -> String {
        let action = args.get("action").and_then(|a| a.as_str()).unwrap_or("");
        match action {
            "create" => self.create(
                session_id,
                args.get("task").and_then(|t| t.as_str()).unwrap_or(""),
                string_list(args.get("steps")),
            ),
            "update_step" => self.update_step(
                session_id,
                args.get("step_index").and_then(|i| i.as_i64()).unwrap_or(0),
                args.get("status")
                    .and_then(|s| s.as_str())
                    .unwrap_or("completed"),
                args.get("result").and_then(|r| r.as_str()),
            ),
            "add_steps" => self.add_steps(
                session_id,
                string_list(args.get("steps")),
                args.get("after_index").and_then(|i| i.as_i64()),
            ),
            other => format!("Unknown action: {other}"),
        }
    }

    fn create(&self, session_id: &str, task: &str, steps: Vec<String>) -> String {
        if task.is_empty() {
            return "Error: task description is required".into();
        }
        if steps.is_empty() {
            return "Error: at least one step is required".into();
        }

        let mut todos = self.todos.lock();
        // Archive any existing plan as history before replacing it.
        if let Some(existing) = todos.remove(session_id) {
            self.history
                .lock()
                .entry(session_id.to_string())
                .or_default()
                .push(existing);
        }

        let todo = SessionTodo {
            task: task.to_string(),
            steps: steps.into_iter().map(TodoStep::new).collect(),
            filename: make_filename(task),
        };
        let rendered = format_state(&todo);
        todos.insert(session_id.to_string(), todo);
        rendered
    }

    fn update_step(
        &self,
        session_id: &str,
        step_index: i64,
        status: &str,
        result: Option<&str>,
    ) -> String {
        let mut todos = self.todos.lock();
        let Some(todo) = todos.get_mut(session_id) else {
            return "Error: no TODO plan exists for this session".into();
        };
        if step_index < 0 || step_index as usize >= todo.steps.len() {
            return format!(
                "Error: step_index {step_index} out of range (0-{})",
                todo.steps.len() - 1
            );
        }
        let step = &mut todo.steps[step_index as usize];
        step.status = status.to_string();
        if let Some(r) = result {
            step.result = Some(r.to_string());
        }
        format_state(todo)
    }

    fn add_steps(&self, session_id: &str, steps: Vec<String>, after_index: Option<i64>) -> String {
        let mut todos = self.todos.lock();
        let Some(todo) = todos.get_mut(session_id) else {
            return "Error: no TODO plan exists for this session".into();
        };
        if steps.is_empty() {
            return "Error: at least one step is required".into();
        }

        let new_steps: Vec<TodoStep> = steps.into_iter().map(TodoStep::new).collect();
        match after_index {
            Some(idx) if idx >= 0 && (idx as usize) < todo.steps.len() => {
                let insert_at = idx as usize + 1;
                todo.steps.splice(insert_at..insert_at, new_steps);
            }
            _ => todo.steps.extend(new_steps),
        }
        format_state(todo)
    }

    pub fn get_state(&self, session_id: &str) -> Option<SessionTodo> {
        self.todos.lock().get(session_id).cloned()
    }

    /// Compact state block injected into the instructions each iteration,
    /// with an explicit directive for the next action.
    pub fn state_prompt(&self, session_id: &str) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();

        if let Some(history) = self.history.lock().get(session_id) {
            if !history.is_empty() {
                let mut lines = vec!["<previous_attempts>".to_string()];
                for h in history {
                    lines.push(format!("Task: {}", h.task));
                    for (i, step) in h.steps.iter().enumerate() {
                        lines.push(format!(
                            "  {i}. [{}] {}{}",
                            step.status,
                            step.description,
                            step.result
                                .as_deref()
                                .map(|r| format!(" — {r}"))
                                .unwrap_or_default()
                        ));
                    }
                    lines.push(String::new());
                }
                lines.push(
                    "Use these past results to inform your approach. Avoid repeating \
                     strategies that failed before."
                        .into(),
                );
                lines.push("</previous_attempts>".into());
                parts.push(lines.join("\n"));
            }
        }

        let todos = self.todos.lock();
        let Some(todo) = todos.get(session_id) else {
            return parts.into_iter().next();
        };

        let mut lines = vec![
            "<current_todo>".to_string(),
            format!("Task: {}", todo.task),
            "Steps:".to_string(),
        ];
        let mut first_pending = None;
        let mut in_progress_idx = None;
        let mut failed_idx = None;
        for (i, step) in todo.steps.iter().enumerate() {
            lines.push(format!(
                "  {i}. [{}] {}{}",
                step.status,
                step.description,
                step.result
                    .as_deref()
                    .map(|r| format!(" — {r}"))
                    .unwrap_or_default()
            ));
            match step.status.as_str() {
                "in_progress" => in_progress_idx = Some(i),
                "failed" if failed_idx.is_none() => failed_idx = Some(i),
                "pending" if first_pending.is_none() => first_pending = Some(i),
                _ => {}
            }
        }

        if let Some(idx) = failed_idx {
            lines.push(format!(
                "\nSTOP: Step {idx} has failed. Do NOT continue with remaining steps. \
                 Inform the user about the failure and what went wrong. If the user asks \
                 to retry, create a new plan with a different approach."
            ));
        } else if let Some(idx) = in_progress_idx {
            lines.push(format!(
                "\nACTION REQUIRED: Step {idx} is in_progress. Execute it now, then call \
                 manage_todo(action=\"update_step\", step_index={idx}, status=\"completed\", \
                 result=\"...\")."
            ));
        } else if let Some(idx) = first_pending {
            lines.push(format!(
                "\nACTION REQUIRED: Call manage_todo(action=\"update_step\", step_index={idx}, \
                 status=\"in_progress\") to start the next step."
            ));
        } else if todo.steps.iter().all(|s| s.status == "completed") {
            lines.push("\nAll steps completed. Provide a final summary to the user.".into());
        }

        lines.push("</current_todo>".into());
        parts.push(lines.join("\n"));
        Some(parts.join("\n\n"))
    }

    /// Render the plan as markdown for the session TODO file.
    pub fn render_markdown(todo: &SessionTodo) -> String {
        let mut lines = vec![
            "# TODO".to_string(),
            String::new(),
            format!("**Task**: {}", todo.task),
            String::new(),
            "## Steps".to_string(),
        ];

        let mut completed = 0;
        let mut in_progress = false;
        for step in &todo.steps {
            match step.status.as_str() {
                "completed" => {
                    completed += 1;
                    lines.push(format!("- [x] ~~{}~~ ✓", step.description));
                    if let Some(r) = &step.result {
                        lines.push(format!("  > {r}"));
                    }
                }
                "in_progress" => {
                    in_progress = true;
                    lines.push(format!("- [ ] **{}** ← in progress", step.description));
                }
                "failed" => {
                    lines.push(format!("- [ ] ~~{}~~ ✗", step.description));
                    if let Some(r) = &step.result {
                        lines.push(format!("  > {r}"));
                    }
                }
                _ => lines.push(format!("- [ ] {}", step.description)),
            }
        }

        let total = todo.steps.len();
        let status = if completed == total {
            "Completed"
        } else if in_progress {
            "In Progress"
        } else {
            "Pending"
        };
        lines.push(String::new());
        lines.push("---".into());
        lines.push(format!(
            "Progress: {completed}/{total} completed | Status: {status}"
        ));
        lines.join("\n")
    }

    pub fn clear_session(&self, session_id: &str) {
        self.todos.lock().remove(session_id);
        self.history.lock().remove(session_id);
    }
}

fn make_filename(task: &str) -> String {
    let slug: String = task
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug = &slug[..slug.len().min(40)];
    format!("TODO-{slug}-{}.md", Utc::now().format("%H%M%S"))
}

fn format_state(todo: &SessionTodo) -> String {
    let mut lines = vec![format!("TODO Plan: {}", todo.task), String::new()];
    for (i, step) in todo.steps.iter().enumerate() {
        let icon = match step.status.as_str() {
            "in_progress" => "⟳",
            "completed" => "✓",
            "failed" => "✗",
            _ => "○",
        };
        lines.push(format!(
            "  {icon} {i}. {}{}",
            step.description,
            step.result
                .as_deref()
                .map(|r| format!(" — {r}"))
                .unwrap_or_default()
        ));
    }
    let completed = todo.steps.iter().filter(|s| s.status == "completed").count();
    lines.push(format!("\nProgress: {completed}/{} completed", todo.steps.len()));
    lines.join("\n")
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
