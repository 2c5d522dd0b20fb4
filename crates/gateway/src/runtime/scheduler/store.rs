//! Periodic task store — in-memory with JSON persistence under the state
//! directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use cadence_domain::error::{Error, Result};

use super::model::{PeriodicTask, PeriodicTaskRun, TaskStatus};

pub struct TaskStore {
    tasks_path: PathBuf,
    tasks: RwLock<HashMap<Uuid, PeriodicTask>>,
    runs: RwLock<Vec<PeriodicTaskRun>>,
}

impl TaskStore {
    /// Load or create the store at `state_path/periodic_tasks.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let tasks_path = state_path.join("periodic_tasks.json");

        let tasks: HashMap<Uuid, PeriodicTask> = if tasks_path.exists() {
            let raw = std::fs::read_to_string(&tasks_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            tasks = tasks.len(),
            path = %tasks_path.display(),
            "periodic task store loaded"
        );

        Ok(Self {
            tasks_path,
            tasks: RwLock::new(tasks),
            runs: RwLock::new(Vec::new()),
        })
    }

    fn persist(&self) {
        let tasks = self.tasks.read();
        match serde_json::to_string_pretty(&*tasks) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.tasks_path, raw) {
                    tracing::warn!(error = %e, "failed to persist periodic tasks");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize periodic tasks"),
        }
    }

    pub fn insert(&self, task: PeriodicTask) {
        self.tasks.write().insert(task.id, task);
        self.persist();
    }

    pub fn get(&self, id: &Uuid) -> Option<PeriodicTask> {
        self.tasks.read().get(id).cloned()
    }

    pub fn list_by_session(&self, session_id: &str) -> Vec<PeriodicTask> {
        let mut out: Vec<PeriodicTask> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        out
    }

    /// Active tasks whose `next_run_at` has passed.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Vec<PeriodicTask> {
        self.tasks
            .read()
            .values()
            .filter(|t| {
                t.status == TaskStatus::Active
                    && t.next_run_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect()
    }

    /// Mutate one task in place; persists on success.  Returns the updated
    /// copy.
    pub fn update<F>(&self, id: &Uuid, f: F) -> Option<PeriodicTask>
    where
        F: FnOnce(&mut PeriodicTask),
    {
        let updated = {
            let mut tasks = self.tasks.write();
            let task = tasks.get_mut(id)?;
            f(task);
            task.clone()
        };
        self.persist();
        Some(updated)
    }

    // ── Runs ──────────────────────────────────────────────────────

    pub fn insert_run(&self, run: PeriodicTaskRun) {
        self.runs.write().push(run);
    }

    pub fn update_run<F>(&self, run_id: &Uuid, f: F)
    where
        F: FnOnce(&mut PeriodicTaskRun),
    {
        let mut runs = self.runs.write();
        if let Some(run) = runs.iter_mut().find(|r| r.id == *run_id) {
            f(run);
        }
    }

    pub fn runs_for_task(&self, task_id: &Uuid) -> Vec<PeriodicTaskRun> {
        self.runs
            .read()
            .iter()
            .filter(|r| r.task_id == *task_id)
            .cloned()
            .collect()
    }
}
