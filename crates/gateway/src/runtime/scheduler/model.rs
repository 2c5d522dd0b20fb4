//! Periodic task data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_domain::message::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Schedule specification: structured 5-field cron or a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Cron { cron: CronSpec },
    Interval { interval: IntervalSpec },
}

/// Structured cron fields.  Each field is a number or a cron expression
/// fragment (`"*"`, `"*/5"`, `"1-5"`, `"0,30"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronSpec {
    #[serde(default = "zero_field")]
    pub minute: CronField,
    #[serde(default = "star_field")]
    pub hour: CronField,
    #[serde(default = "star_field")]
    pub day_of_month: CronField,
    #[serde(default = "star_field")]
    pub month: CronField,
    #[serde(default = "star_field")]
    pub day_of_week: CronField,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CronField {
    Number(u32),
    Expr(String),
}

impl std::fmt::Display for CronField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CronField::Number(n) => write!(f, "{n}"),
            CronField::Expr(s) => write!(f, "{s}"),
        }
    }
}

fn zero_field() -> CronField {
    CronField::Number(0)
}
fn star_field() -> CronField {
    CronField::Expr("*".into())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntervalSpec {
    pub every: u64,
    pub unit: IntervalUnit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl IntervalSpec {
    pub fn as_seconds(&self) -> u64 {
        let unit = match self.unit {
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 3_600,
            IntervalUnit::Days => 86_400,
        };
        self.every * unit
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task & run records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_runs: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicTask {
    pub id: Uuid,
    /// Owning user, resolved from the session at registration.
    #[serde(default)]
    pub user: Option<String>,
    pub session_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Execution recipe learned from the dry run (objective, instructions,
    /// output spec).
    pub recipe: serde_json::Value,
    pub schedule: Schedule,
    pub timezone: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default = "default_true")]
    pub notify_on_success: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub stats: TaskStats,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicTaskRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub attempt: u32,
    pub status: RunStatus,
    #[serde(default)]
    pub output_summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub iterations: u64,
    #[serde(default)]
    pub tool_call_count: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PeriodicTaskRun {
    pub fn start(task_id: Uuid, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            attempt,
            status: RunStatus::Running,
            output_summary: None,
            error: None,
            usage: Usage::zero(),
            iterations: 0,
            tool_call_count: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Human-readable schedule description for tool results.
pub fn format_schedule(schedule: &Schedule) -> String {
    match schedule {
        Schedule::Cron { cron } => {
            let minute = cron.minute.to_string();
            let hour = cron.hour.to_string();
            let dow = cron.day_of_week.to_string();

            let time_str = if hour == "*" {
                format!("every hour at :{minute:0>2}")
            } else {
                format!("{hour}:{minute:0>2}")
            };

            match dow.as_str() {
                "*" => format!("Every day at {time_str}"),
                "1-5" => format!("Weekdays at {time_str}"),
                other => format!("Day {other} at {time_str}"),
            }
        }
        Schedule::Interval { interval } => {
            let unit = match interval.unit {
                IntervalUnit::Minutes => "minutes",
                IntervalUnit::Hours => "hours",
                IntervalUnit::Days => "days",
            };
            format!("Every {} {unit}", interval.every)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parses_wire_shape() {
        let schedule: Schedule = serde_json::from_value(serde_json::json!({
            "type": "cron",
            "cron": {"minute": 0, "hour": 9, "day_of_month": "*", "month": "*", "day_of_week": "*"}
        }))
        .unwrap();
        let Schedule::Cron { cron } = &schedule else {
            panic!("expected cron");
        };
        assert_eq!(cron.minute, CronField::Number(0));
        assert_eq!(cron.hour, CronField::Number(9));
        assert_eq!(cron.day_of_week, CronField::Expr("*".into()));
    }

    #[test]
    fn cron_defaults_fill_missing_fields() {
        let schedule: Schedule = serde_json::from_value(serde_json::json!({
            "type": "cron",
            "cron": {"hour": 9}
        }))
        .unwrap();
        let Schedule::Cron { cron } = &schedule else {
            panic!("expected cron");
        };
        // Minute defaults to 0, everything else to "*".
        assert_eq!(cron.minute, CronField::Number(0));
        assert_eq!(cron.hour, CronField::Number(9));
        assert_eq!(cron.day_of_month, CronField::Expr("*".into()));
        assert_eq!(cron.month, CronField::Expr("*".into()));
        assert_eq!(cron.day_of_week, CronField::Expr("*".into()));
    }

    #[test]
    fn interval_parses_and_converts() {
        let schedule: Schedule = serde_json::from_value(serde_json::json!({
            "type": "interval",
            "interval": {"every": 2, "unit": "hours"}
        }))
        .unwrap();
        let Schedule::Interval { interval } = &schedule else {
            panic!("expected interval");
        };
        assert_eq!(interval.as_seconds(), 7_200);
    }

    #[test]
    fn schedule_display() {
        let daily: Schedule = serde_json::from_value(serde_json::json!({
            "type": "cron", "cron": {"minute": 30, "hour": 9}
        }))
        .unwrap();
        assert_eq!(format_schedule(&daily), "Every day at 9:30");

        let weekdays: Schedule = serde_json::from_value(serde_json::json!({
            "type": "cron", "cron": {"minute": 0, "hour": 18, "day_of_week": "1-5"}
        }))
        .unwrap();
        assert_eq!(format_schedule(&weekdays), "Weekdays at 18:00");
    }
}
