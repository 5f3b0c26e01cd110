//! Scheduled task definitions and status reporting types.

use crate::scheduler::cron::CronSchedule;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;

/// Callback type for executing a task.
///
/// Arguments are bound at registration time by closure capture; the
/// scheduler invokes every handler uniformly. Any error the handler
/// returns is caught and logged at the scheduler boundary and never
/// propagates past `check_and_run_tasks`.
pub type TaskHandler = Arc<dyn Fn() -> crate::Result<()> + Send + Sync>;

/// A task that runs on a cron schedule.
///
/// Owned exclusively by the scheduler's task map; created by `add_task`
/// and mutated only by `check_and_run_tasks`.
#[derive(Clone)]
pub struct ScheduledTask {
    /// Unique task name.
    pub name: String,
    /// The cron expression the task was registered with.
    pub schedule: String,
    /// Parsed form of `schedule`.
    pub(crate) cron: CronSchedule,
    /// The handler invoked when the task fires.
    pub(crate) handler: TaskHandler,
    /// When the task last fired (minute precision), if ever.
    pub last_run: Option<NaiveDateTime>,
    /// When the task next fires; `None` only for a task left inert
    /// after a next-run recomputation failure.
    pub next_run: Option<NaiveDateTime>,
    /// Whether the task is eligible to run.
    pub enabled: bool,
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("last_run", &self.last_run)
            .field("next_run", &self.next_run)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Status snapshot for one task, shaped for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    /// Task name.
    pub name: String,
    /// Cron expression.
    pub schedule: String,
    /// Whether the task is eligible to run.
    pub enabled: bool,
    /// Last run time, or `None` if the task has never fired.
    pub last_run: Option<NaiveDateTime>,
    /// Next scheduled run time.
    pub next_run: Option<NaiveDateTime>,
}

impl From<&ScheduledTask> for TaskStatus {
    fn from(task: &ScheduledTask) -> Self {
        Self {
            name: task.name.clone(),
            schedule: task.schedule.clone(),
            enabled: task.enabled,
            last_run: task.last_run,
            next_run: task.next_run,
        }
    }
}

/// Outcome of one task execution within a `check_and_run_tasks` pass.
#[derive(Debug, Clone)]
pub struct TaskRunResult {
    /// Task name.
    pub name: String,
    /// Whether the handler returned without error.
    pub success: bool,
    /// Error message when the handler failed.
    pub error: Option<String>,
}
