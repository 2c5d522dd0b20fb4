//! `manage_periodic_task` tool execution against the task store.
//!
//! The model registers a task after a successful dry run; the scheduler
//! picks it up on the next beat.  All outcomes are returned as tool result
//! strings.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use cadence_sessions::SessionStore;

use super::scheduler::cron::compute_next_run;
use super::scheduler::model::{
    format_schedule, PeriodicTask, Schedule, TaskStats, TaskStatus,
};
use super::scheduler::store::TaskStore;

pub struct TaskToolService {
    default_timezone: String,
}

impl TaskToolService {
    pub fn new(default_timezone: String) -> Self {
        Self { default_timezone }
    }

    pub async fn execute(
        &self,
        store: &TaskStore,
        sessions: &SessionStore,
        args: &Value,
        session_id: &str,
    ) -> String {
        let action = args.get("action").and_then(|a| a.as_str()).unwrap_or("");
        match action {
            "register" => self.register(store, sessions, args, session_id),
            "list" => self.list(store, session_id),
            "cancel" => self.update_status(store, task_id(args), TaskStatus::Completed),
            "pause" => self.update_status(store, task_id(args), TaskStatus::Paused),
            "resume" => self.resume(store, task_id(args)),
            other => format!("Unknown action: {other}"),
        }
    }

    fn register(
        &self,
        store: &TaskStore,
        sessions: &SessionStore,
        args: &Value,
        session_id: &str,
    ) -> String {
        let title = args.get("title").and_then(|t| t.as_str()).unwrap_or("");
        if title.is_empty() {
            return "Error: title is required".into();
        }
        let Some(recipe) = args.get("recipe").filter(|r| !r.is_null()) else {
            return "Error: recipe is required".into();
        };
        let Some(schedule_value) = args.get("schedule").filter(|s| !s.is_null()) else {
            return "Error: schedule is required".into();
        };
        let schedule: Schedule = match serde_json::from_value(schedule_value.clone()) {
            Ok(s) => s,
            Err(e) => return format!("Error registering periodic task: invalid schedule: {e}"),
        };

        let timezone = args
            .get("timezone")
            .and_then(|t| t.as_str())
            .unwrap_or(&self.default_timezone)
            .to_string();
        let next_run_at = compute_next_run(&schedule, &timezone, &Utc::now());

        let task = PeriodicTask {
            id: Uuid::new_v4(),
            user: sessions.entry(session_id).and_then(|e| e.user_ref),
            session_id: session_id.to_string(),
            title: title.to_string(),
            description: args
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("")
                .to_string(),
            recipe: recipe.clone(),
            schedule: schedule.clone(),
            timezone: timezone.clone(),
            status: TaskStatus::Active,
            next_run_at,
            consecutive_failures: 0,
            notify_on_success: args
                .get("notify_on_success")
                .and_then(|n| n.as_bool())
                .unwrap_or(true),
            max_retries: 3,
            stats: TaskStats::default(),
            created_at: Utc::now(),
        };

        let summary = serde_json::json!({
            "success": true,
            "task": {
                "id": task.id,
                "title": &task.title,
                "description": &task.description,
                "schedule_display": format_schedule(&schedule),
                "timezone": &timezone,
                "next_run_at": task.next_run_at,
                "status": task.status,
                "notify_on_success": task.notify_on_success,
            },
        });
        store.insert(task);
        summary.to_string()
    }

    fn list(&self, store: &TaskStore, session_id: &str) -> String {
        let tasks: Vec<Value> = store
            .list_by_session(session_id)
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "title": t.title,
                    "status": t.status,
                    "schedule_display": format_schedule(&t.schedule),
                    "next_run_at": t.next_run_at,
                    "total_runs": t.stats.total_runs,
                    "total_successes": t.stats.total_successes,
                    "total_failures": t.stats.total_failures,
                })
            })
            .collect();
        serde_json::json!({"success": true, "tasks": tasks}).to_string()
    }

    fn update_status(&self, store: &TaskStore, id: Option<Uuid>, status: TaskStatus) -> String {
        let Some(id) = id else {
            return "Error: task_id is required".into();
        };
        match store.update(&id, |t| {
            t.status = status;
            if status != TaskStatus::Active {
                t.next_run_at = None;
            }
        }) {
            Some(t) => format!(
                "Periodic task {id} updated to status: {}",
                status_str(t.status)
            ),
            None => format!("Error updating task: task {id} not found"),
        }
    }

    fn resume(&self, store: &TaskStore, id: Option<Uuid>) -> String {
        let Some(id) = id else {
            return "Error: task_id is required".into();
        };
        match store.update(&id, |t| {
            t.status = TaskStatus::Active;
            t.consecutive_failures = 0;
            t.next_run_at = compute_next_run(&t.schedule, &t.timezone, &Utc::now());
        }) {
            Some(t) => format!(
                "Periodic task {id} resumed.\n  Next run: {}",
                t.next_run_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "N/A".into())
            ),
            None => format!("Error resuming task: task {id} not found"),
        }
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Active => "active",
        TaskStatus::Paused => "paused",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
    }
}

fn task_id(args: &Value) -> Option<Uuid> {
    args.get("task_id")
        .and_then(|t| t.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fixture() -> (TaskToolService, TaskStore, SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path()).unwrap();
        let sessions = SessionStore::new(Duration::from_secs(3600), 100);
        sessions.get_or_create(Some("s1"));
        (
            TaskToolService::new("Asia/Seoul".into()),
            store,
            sessions,
            dir,
        )
    }

    #[tokio::test]
    async fn register_computes_next_run() {
        let (service, store, sessions, _dir) = fixture();
        let out = service
            .execute(
                &store,
                &sessions,
                &serde_json::json!({
                    "action": "register",
                    "title": "Morning digest",
                    "recipe": {"objective": "summarize news", "instructions": ["fetch", "summarize"]},
                    "schedule": {"type": "cron", "cron": {"minute": 0, "hour": 9}},
                    "timezone": "Asia/Seoul",
                }),
                "s1",
            )
            .await;

        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["task"]["schedule_display"], "Every day at 9:00");
        assert!(!parsed["task"]["next_run_at"].is_null());

        let tasks = store.list_by_session("s1");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn register_requires_fields() {
        let (service, store, sessions, _dir) = fixture();
        let out = service
            .execute(&store, &sessions, &serde_json::json!({"action": "register"}), "s1")
            .await;
        assert_eq!(out, "Error: title is required");

        let out = service
            .execute(
                &store,
                &sessions,
                &serde_json::json!({"action": "register", "title": "t"}),
                "s1",
            )
            .await;
        assert_eq!(out, "Error: recipe is required");
    }

    #[tokio::test]
    async fn pause_and_resume_cycle() {
        let (service, store, sessions, _dir) = fixture();
        service
            .execute(
                &store,
                &sessions,
                &serde_json::json!({
                    "action": "register",
                    "title": "t",
                    "recipe": {"objective": "o"},
                    "schedule": {"type": "interval", "interval": {"every": 1, "unit": "hours"}},
                }),
                "s1",
            )
            .await;
        let id = store.list_by_session("s1")[0].id;

        let out = service
            .execute(
                &store,
                &sessions,
                &serde_json::json!({"action": "pause", "task_id": id.to_string()}),
                "s1",
            )
            .await;
        assert!(out.contains("paused"));
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::Paused);
        assert!(store.get(&id).unwrap().next_run_at.is_none());

        let out = service
            .execute(
                &store,
                &sessions,
                &serde_json::json!({"action": "resume", "task_id": id.to_string()}),
                "s1",
            )
            .await;
        assert!(out.contains("resumed"));
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert!(task.next_run_at.is_some());
    }
}
