//! Scheduler beat loop and per-task execution.
//!
//! Every beat selects active tasks whose `next_run_at` has passed,
//! advances `next_run_at` immediately (a duplicate beat is then harmless),
//! and hands each task to the worker pool.  A run retries with
//! exponential backoff; the consecutive-failure threshold parks the task.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::cron::compute_next_run;
use super::model::{PeriodicTask, PeriodicTaskRun, RunStatus, TaskStatus};
use crate::runtime::turn::run_headless_turn;
use crate::state::AppState;

/// Spawn the beat loop.  Runs until the process exits.
pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    let interval = std::time::Duration::from_secs(state.config.scheduler.beat_interval_secs);
    let workers = Arc::new(Semaphore::new(state.config.scheduler.workers));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            beat(&state, &workers).await;
        }
    })
}

/// One beat: dispatch every due task.
pub async fn beat(state: &AppState, workers: &Arc<Semaphore>) {
    let now = Utc::now();
    let due = state.task_store.due_tasks(now);
    if due.is_empty() {
        return;
    }
    tracing::info!(count = due.len(), "dispatching due periodic task(s)");

    for task in due {
        // Advance next_run_at before dispatch to prevent double dispatch.
        state.task_store.update(&task.id, |t| {
            t.next_run_at = compute_next_run(&t.schedule, &t.timezone, &now);
        });

        let permit = match workers.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let state = state.clone();
        let task_id = task.id;
        tokio::spawn(async move {
            execute_task(&state, task_id).await;
            drop(permit);
        });
    }
}

/// Execute one task with retry and the run lifecycle.
pub async fn execute_task(state: &AppState, task_id: Uuid) {
    let Some(task) = state.task_store.get(&task_id) else {
        tracing::warn!(%task_id, "periodic task not found, skipping");
        return;
    };

    let cfg = &state.config.scheduler;
    let max_retries = task.max_retries.max(1);

    for attempt in 1..=max_retries {
        let run = PeriodicTaskRun::start(task_id, attempt);
        let run_id = run.id;
        state.task_store.insert_run(run);

        let prompt = build_execution_prompt(&task.recipe);
        let hard_timeout = std::time::Duration::from_secs(cfg.hard_timeout_secs);
        let soft_timeout = std::time::Duration::from_secs(cfg.soft_timeout_secs);

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            hard_timeout,
            run_headless_turn(state, &task.session_id, prompt),
        )
        .await;
        if started.elapsed() > soft_timeout {
            tracing::warn!(
                %task_id,
                elapsed_secs = started.elapsed().as_secs(),
                soft_secs = cfg.soft_timeout_secs,
                "periodic task run exceeded soft timeout"
            );
        }

        match outcome {
            Ok(Ok(response)) => {
                handle_success(state, &task, run_id, &response).await;
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    %task_id, attempt, max_retries, error = %e,
                    "periodic task attempt failed"
                );
                state.task_store.update_run(&run_id, |r| {
                    r.status = RunStatus::Failed;
                    r.error = Some(e.to_string());
                    r.completed_at = Some(Utc::now());
                });
                if attempt < max_retries {
                    let delay = cfg.retry_base_delay_secs * 2u64.pow(attempt - 1);
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                    continue;
                }
                handle_final_failure(state, &task, run_id, attempt, &e.to_string()).await;
            }
            Err(_) => {
                let message = format!("run exceeded hard timeout ({}s)", cfg.hard_timeout_secs);
                tracing::warn!(%task_id, attempt, "periodic task timed out");
                state.task_store.update_run(&run_id, |r| {
                    r.status = RunStatus::Failed;
                    r.error = Some(message.clone());
                    r.completed_at = Some(Utc::now());
                });
                if attempt < max_retries {
                    let delay = cfg.retry_base_delay_secs * 2u64.pow(attempt - 1);
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                    continue;
                }
                handle_final_failure(state, &task, run_id, attempt, &message).await;
            }
        }
        return;
    }
}

/// Build the synthetic headless user prompt from the task recipe.
pub fn build_execution_prompt(recipe: &serde_json::Value) -> String {
    let now_str = Utc::now().format("%Y-%m-%d %H:%M:%S");
    let instructions = recipe
        .get("instructions")
        .and_then(|i| i.as_array())
        .map(|steps| {
            steps
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_str().map(|s| format!("  {}. {s}", i + 1)))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let mut parts = vec![
        "You are executing a scheduled periodic task.".to_string(),
        format!("Current date and time: {now_str}"),
        format!(
            "Original user request: {}",
            recipe
                .get("original_request")
                .and_then(|v| v.as_str())
                .unwrap_or("N/A")
        ),
        format!(
            "Task objective: {}",
            recipe.get("objective").and_then(|v| v.as_str()).unwrap_or("")
        ),
        String::new(),
        "Instructions — follow each step in order:".to_string(),
        instructions,
    ];

    let output_spec = recipe.get("output_spec").cloned().unwrap_or_default();
    if let Some(pattern) = output_spec.get("file_pattern").and_then(|v| v.as_str()) {
        parts.push(format!("\nFile output pattern: {pattern}"));
    }
    if let Some(notification) = output_spec.get("notification") {
        parts.push(format!(
            "\nNotification title template: {}",
            notification
                .get("title_template")
                .and_then(|v| v.as_str())
                .unwrap_or("N/A")
        ));
        parts.push(format!(
            "Notification body template: {}",
            notification
                .get("body_template")
                .and_then(|v| v.as_str())
                .unwrap_or("N/A")
        ));
    }

    parts.push(
        "\nIMPORTANT: You MUST call notify_user at the end to send the results to the \
         user. Execute all instructions now."
            .to_string(),
    );
    parts.join("\n")
}

async fn handle_success(
    state: &AppState,
    task: &PeriodicTask,
    run_id: Uuid,
    response: &cadence_domain::responses::ResponseObject,
) {
    let output_text = response.output_text();
    let iterations = response
        .metadata
        .get("iterations")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let tool_call_count = response
        .metadata
        .get("tool_call_count")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    state.task_store.update_run(&run_id, |r| {
        r.status = RunStatus::Completed;
        r.output_summary = Some(truncate_chars(&output_text, 2_000));
        r.usage = response.usage;
        r.iterations = iterations;
        r.tool_call_count = tool_call_count;
        r.completed_at = Some(Utc::now());
    });

    let now = Utc::now();
    state.task_store.update(&task.id, |t| {
        t.stats.total_runs += 1;
        t.stats.total_successes += 1;
        t.stats.last_run_at = Some(now);
        t.consecutive_failures = 0;
        t.next_run_at = compute_next_run(&t.schedule, &t.timezone, &now);
    });

    tracing::info!(task_id = %task.id, %run_id, "periodic task completed");

    if task.notify_on_success {
        let body = if output_text.is_empty() {
            "Task completed successfully.".to_string()
        } else {
            truncate_chars(&output_text, 200)
        };
        state
            .notify
            .send(
                &task.session_id,
                &format!("Task completed: {}", task.title),
                &body,
                Some(serde_json::json!({
                    "type": "periodic_task_completed",
                    "task_id": task.id,
                    "run_id": run_id,
                    "session_id": task.session_id,
                })),
            )
            .await;
    }
}

async fn handle_final_failure(
    state: &AppState,
    task: &PeriodicTask,
    run_id: Uuid,
    attempts: u32,
    error: &str,
) {
    let now = Utc::now();
    let updated = state.task_store.update(&task.id, |t| {
        t.stats.total_runs += 1;
        t.stats.total_failures += 1;
        t.stats.last_run_at = Some(now);
        t.consecutive_failures += 1;
        if t.consecutive_failures >= t.max_retries {
            t.status = TaskStatus::Failed;
            t.next_run_at = None;
        } else {
            t.next_run_at = compute_next_run(&t.schedule, &t.timezone, &now);
        }
    });

    tracing::error!(task_id = %task.id, %run_id, error, "periodic task failed");

    if let Some(t) = updated {
        if t.status == TaskStatus::Failed {
            tracing::warn!(task_id = %t.id, "task parked after consecutive failures");
        }
    }

    state
        .notify
        .send(
            &task.session_id,
            &format!("Task failed: {}", task.title),
            &format!(
                "Failed after {attempts} attempts: {}",
                truncate_chars(error, 200)
            ),
            Some(serde_json::json!({
                "type": "periodic_task_failed",
                "task_id": task.id,
                "run_id": run_id,
                "session_id": task.session_id,
            })),
        )
        .await;
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
