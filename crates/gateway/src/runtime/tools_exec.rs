//! Server-side tool dispatch.
//!
//! A registry of handlers with one capability: `execute(name, args,
//! session) → result`.  Dispatch order: explicitly registered handlers,
//! agent-internal tools, session-file tools, then MCP-discovered tools.
//! Execution failures become tool result strings; they never terminate the
//! turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use cadence_domain::error::{Error, Result};
use cadence_domain::message::{Message, ToolCall};
use cadence_mcp_client::McpClient;
use cadence_sessions::SessionStore;
use cadence_tools::catalog::SESSION_FILE_TOOLS;

use super::files::SessionFileClient;
use super::notify::NotificationClient;
use super::scheduler::store::TaskStore;
use super::tasks::TaskToolService;
use super::todo::TodoService;

/// One pluggable server-side tool executor.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, name: &str, args: &Value, session_id: &str) -> Result<String>;
}

pub struct ToolRouter {
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
    todo: Arc<TodoService>,
    notify: Arc<NotificationClient>,
    files: Arc<SessionFileClient>,
    tasks: Arc<TaskToolService>,
    task_store: Arc<TaskStore>,
    sessions: Arc<SessionStore>,
    mcp: Arc<McpClient>,
    tool_timeout: Duration,
}

impl ToolRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        todo: Arc<TodoService>,
        notify: Arc<NotificationClient>,
        files: Arc<SessionFileClient>,
        tasks: Arc<TaskToolService>,
        task_store: Arc<TaskStore>,
        sessions: Arc<SessionStore>,
        mcp: Arc<McpClient>,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            todo,
            notify,
            files,
            tasks,
            task_store,
            sessions,
            mcp,
            tool_timeout,
        }
    }

    /// Register (or replace) a handler for a tool name.
    pub fn register_handler(&self, name: &str, handler: Arc<dyn ToolHandler>) {
        self.handlers.write().insert(name.to_string(), handler);
    }

    /// Whether a server-side call can be executed at all.  Calls failing
    /// this check surface as `tool_not_implemented`.
    pub fn is_executable(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
            || name == "manage_periodic_task"
            || name == "notify_user"
            || name == "manage_todo"
            || SESSION_FILE_TOOLS.contains(&name)
            || self.mcp.is_server_tool(name)
    }

    /// Dispatch a tool call by name.
    pub async fn dispatch(&self, name: &str, args: &Value, session_id: &str) -> Result<String> {
        let handler = self.handlers.read().get(name).cloned();
        if let Some(handler) = handler {
            return handler.execute(name, args, session_id).await;
        }

        match name {
            "manage_periodic_task" => Ok(self
                .tasks
                .execute(&self.task_store, &self.sessions, args, session_id)
                .await),
            "notify_user" => Ok(self.notify.execute(args, session_id).await),
            "manage_todo" => {
                let result = self.todo.execute(args, session_id);
                self.persist_todo_file(session_id);
                Ok(result)
            }
            _ if SESSION_FILE_TOOLS.contains(&name) => {
                Ok(self.files.execute(name, args, session_id).await)
            }
            _ if self.mcp.is_server_tool(name) => Ok(self.mcp.call_tool(name, args).await),
            _ => Err(Error::ToolNotImplemented(name.to_string())),
        }
    }

    /// Execute one call, converting failures and timeouts into readable
    /// tool output.
    pub async fn safe_execute(&self, tc: &ToolCall, session_id: &str) -> String {
        let outcome =
            tokio::time::timeout(self.tool_timeout, self.dispatch(&tc.name, &tc.args, session_id))
                .await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(tool = %tc.name, error = %e, "tool execution failed");
                format!("Error executing tool '{}': {e}", tc.name)
            }
            Err(_) => {
                tracing::warn!(tool = %tc.name, timeout = ?self.tool_timeout, "tool timed out");
                format!(
                    "Error executing tool '{}': timed out after {}s",
                    tc.name,
                    self.tool_timeout.as_secs()
                )
            }
        }
    }

    /// Execute a batch in parallel (one task per call), joining before
    /// returning.  Results come back as tool messages in call order.
    pub async fn execute_batch(&self, calls: &[ToolCall], session_id: &str) -> Vec<Message> {
        let futures: Vec<_> = calls
            .iter()
            .map(|tc| self.safe_execute(tc, session_id))
            .collect();
        let results = futures_util::future::join_all(futures).await;

        calls
            .iter()
            .zip(results)
            .map(|(tc, content)| Message::tool_result(&tc.id, &tc.name, content))
            .collect()
    }

    /// Write the rendered TODO markdown to session files, fire-and-forget.
    fn persist_todo_file(&self, session_id: &str) {
        let Some(todo) = self.todo.get_state(session_id) else {
            return;
        };
        let files = self.files.clone();
        let session_id = session_id.to_string();
        let content = TodoService::render_markdown(&todo);
        let filename = todo.filename;
        tokio::spawn(async move {
            let out = files.write_file(&session_id, &filename, &content).await;
            if out.starts_with("Error") {
                tracing::warn!(%session_id, %filename, "failed to persist TODO file: {out}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_domain::config::{McpConfig, PlatformConfig, SchedulerConfig};

    pub(crate) fn test_router() -> ToolRouter {
        let platform = PlatformConfig::default();
        let scheduler_cfg = SchedulerConfig::default();
        let dir = tempfile::tempdir().unwrap();
        ToolRouter::new(
            Arc::new(TodoService::new()),
            Arc::new(NotificationClient::new(&platform)),
            Arc::new(SessionFileClient::new(&platform)),
            Arc::new(TaskToolService::new(scheduler_cfg.default_timezone.clone())),
            Arc::new(TaskStore::new(dir.path()).unwrap()),
            Arc::new(SessionStore::new(Duration::from_secs(3600), 100)),
            Arc::new(McpClient::new(&McpConfig::default())),
            Duration::from_secs(5),
        )
    }

    struct EchoHandler;

    #[async_trait::async_trait]
    impl ToolHandler for EchoHandler {
        async fn execute(&self, _name: &str, args: &Value, _session_id: &str) -> Result<String> {
            Ok(format!("echo: {args}"))
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl ToolHandler for FailingHandler {
        async fn execute(&self, _name: &str, _args: &Value, _session_id: &str) -> Result<String> {
            Err(Error::ToolExecution("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn registered_handler_takes_precedence() {
        let router = test_router();
        router.register_handler("bash", Arc::new(EchoHandler));
        assert!(router.is_executable("bash"));

        let out = router
            .dispatch("bash", &serde_json::json!({"command": "ls"}), "s1")
            .await
            .unwrap();
        assert_eq!(out, "echo: {\"command\":\"ls\"}");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_implemented() {
        let router = test_router();
        assert!(!router.is_executable("quantum_flux"));
        let err = router
            .dispatch("quantum_flux", &serde_json::json!({}), "s1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "tool_not_implemented");
    }

    #[tokio::test]
    async fn failures_become_tool_output() {
        let router = test_router();
        router.register_handler("explode", Arc::new(FailingHandler));
        let tc = ToolCall {
            id: "c1".into(),
            name: "explode".into(),
            args: serde_json::json!({}),
        };
        let out = router.safe_execute(&tc, "s1").await;
        assert!(out.starts_with("Error executing tool 'explode':"));
        assert!(out.contains("disk on fire"));
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let router = test_router();
        router.register_handler("echo", Arc::new(EchoHandler));
        let calls = vec![
            ToolCall {
                id: "c1".into(),
                name: "echo".into(),
                args: serde_json::json!({"n": 1}),
            },
            ToolCall {
                id: "c2".into(),
                name: "echo".into(),
                args: serde_json::json!({"n": 2}),
            },
        ];
        let results = router.execute_batch(&calls, "s1").await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(results[1].tool_call_id.as_deref(), Some("c2"));
        assert!(results[1].content.contains("\"n\":2"));
    }

    #[tokio::test]
    async fn todo_tool_executes_inline() {
        let router = test_router();
        let out = router
            .dispatch(
                "manage_todo",
                &serde_json::json!({"action": "create", "task": "t", "steps": ["a"]}),
                "s1",
            )
            .await
            .unwrap();
        assert!(out.contains("TODO Plan: t"));
    }
}
