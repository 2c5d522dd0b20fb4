//! Periodic task internal API.
//!
//! No user auth on these routes — the owner is resolved through the
//! session.  The scheduler's beat uses `/due`; clients and the platform
//! use create/list/update/resume.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::runtime::scheduler::cron::compute_next_run;
use crate::runtime::scheduler::model::{
    PeriodicTask, Schedule, TaskStats, TaskStatus,
};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub session_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub recipe: serde_json::Value,
    pub schedule: Schedule,
    #[serde(default)]
    pub timezone_name: Option<String>,
    #[serde(default = "default_true")]
    pub notify_on_success: bool,
}

fn default_true() -> bool {
    true
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> impl IntoResponse {
    if !state.sessions.exists(&body.session_id) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "session not found"})),
        )
            .into_response();
    }

    let timezone = body
        .timezone_name
        .unwrap_or_else(|| state.config.scheduler.default_timezone.clone());
    let next_run_at = compute_next_run(&body.schedule, &timezone, &Utc::now());

    let task = PeriodicTask {
        id: Uuid::new_v4(),
        user: state
            .sessions
            .entry(&body.session_id)
            .and_then(|e| e.user_ref),
        session_id: body.session_id,
        title: body.title,
        description: body.description,
        recipe: body.recipe,
        schedule: body.schedule,
        timezone,
        status: TaskStatus::Active,
        next_run_at,
        consecutive_failures: 0,
        notify_on_success: body.notify_on_success,
        max_retries: state.config.scheduler.max_retries,
        stats: TaskStats::default(),
        created_at: Utc::now(),
    };
    let view = serde_json::to_value(&task).unwrap_or_default();
    state.task_store.insert(task);

    (StatusCode::CREATED, Json(view)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub session_id: String,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    Json(state.task_store.list_by_session(&query.session_id))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    pub status: TaskStatus,
}

pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateTaskRequest>,
) -> impl IntoResponse {
    match state.task_store.update(&id, |t| {
        t.status = body.status;
        if body.status != TaskStatus::Active {
            t.next_run_at = None;
        }
    }) {
        Some(task) => Json(serde_json::to_value(&task).unwrap_or_default()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "task not found"})),
        )
            .into_response(),
    }
}

pub async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.task_store.update(&id, |t| {
        t.status = TaskStatus::Active;
        t.consecutive_failures = 0;
        t.next_run_at = compute_next_run(&t.schedule, &t.timezone, &Utc::now());
    }) {
        Some(task) => Json(serde_json::to_value(&task).unwrap_or_default()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "task not found"})),
        )
            .into_response(),
    }
}

/// Active tasks with `next_run_at <= now`, including the owning user.
pub async fn due_tasks(State(state): State<AppState>) -> impl IntoResponse {
    let due: Vec<serde_json::Value> = state
        .task_store
        .due_tasks(Utc::now())
        .iter()
        .map(|t| {
            let mut v = serde_json::to_value(t).unwrap_or_default();
            v["user_id"] = serde_json::json!(t.user);
            v
        })
        .collect();
    Json(due)
}
