//! Cron-driven task scheduler.
//!
//! Owns a map of named tasks, decides when each is due, executes due
//! tasks sequentially on the calling thread, and reschedules them. The
//! task map sits behind a mutex and the stop flag is atomic, so status
//! reads and `stop()` work from other threads while `run_forever`
//! blocks the scheduling thread.

use crate::error::Result;
use crate::scheduler::cron::{CronSchedule, truncate_to_minute};
use crate::scheduler::tasks::{ScheduledTask, TaskHandler, TaskRunResult, TaskStatus};
use chrono::{Local, NaiveDateTime};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// Schedules and executes tasks based on cron expressions.
pub struct Scheduler {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    running: AtomicBool,
}

impl Scheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Register a task, eagerly computing its initial next-run time.
    ///
    /// Registering a name that already exists replaces the prior task
    /// (logged as a warning, not an error).
    ///
    /// # Errors
    ///
    /// Returns [`crate::DaemonError::Config`] for a malformed cron
    /// expression and [`crate::DaemonError::Scheduler`] when no next
    /// run exists within the scan horizon.
    pub fn add_task(&self, name: &str, schedule: &str, handler: TaskHandler) -> Result<()> {
        let cron = CronSchedule::parse(schedule)?;
        let next_run = cron.next_run(Local::now().naive_local())?;

        let task = ScheduledTask {
            name: name.to_owned(),
            schedule: schedule.to_owned(),
            cron,
            handler,
            last_run: None,
            next_run: Some(next_run),
            enabled: true,
        };

        let mut tasks = self.lock_tasks();
        if tasks.insert(name.to_owned(), task).is_some() {
            warn!("task '{name}' already exists, replacing");
        }
        info!("scheduled task '{name}' with '{schedule}', next run {next_run}");
        Ok(())
    }

    /// Remove a task. Unknown names are ignored.
    pub fn remove_task(&self, name: &str) {
        if self.lock_tasks().remove(name).is_some() {
            info!("removed task '{name}'");
        }
    }

    /// Remove all tasks.
    pub fn clear_tasks(&self) {
        self.lock_tasks().clear();
    }

    /// Mark a task eligible to run. Unknown names are ignored.
    pub fn enable_task(&self, name: &str) {
        if let Some(task) = self.lock_tasks().get_mut(name) {
            task.enabled = true;
            info!("enabled task '{name}'");
        }
    }

    /// Mark a task ineligible without losing its schedule state.
    pub fn disable_task(&self, name: &str) {
        if let Some(task) = self.lock_tasks().get_mut(name) {
            task.enabled = false;
            info!("disabled task '{name}'");
        }
    }

    /// Status snapshot for one task, or `None` if unknown.
    #[must_use]
    pub fn get_task_status(&self, name: &str) -> Option<TaskStatus> {
        self.lock_tasks().get(name).map(TaskStatus::from)
    }

    /// Status snapshots for all tasks.
    #[must_use]
    pub fn get_all_tasks_status(&self) -> Vec<TaskStatus> {
        self.lock_tasks().values().map(TaskStatus::from).collect()
    }

    /// Next scheduled run for one task, or `None` if unknown or inert.
    #[must_use]
    pub fn next_run_of(&self, name: &str) -> Option<NaiveDateTime> {
        self.lock_tasks().get(name).and_then(|t| t.next_run)
    }

    /// Handler registered for one task, or `None` if unknown.
    #[must_use]
    pub fn handler_of(&self, name: &str) -> Option<TaskHandler> {
        self.lock_tasks().get(name).map(|t| t.handler.clone())
    }

    /// Run every enabled task whose next-run time has arrived.
    ///
    /// Due tasks execute synchronously and strictly sequentially; a
    /// failing handler is caught and logged so it cannot abort the
    /// batch. `last_run` is recorded regardless of outcome and
    /// `next_run` is recomputed from the current minute. If that
    /// recomputation fails the task is disabled and left inert.
    pub fn check_and_run_tasks(&self) -> Vec<TaskRunResult> {
        let now = truncate_to_minute(Local::now().naive_local());
        let mut results = Vec::new();

        let due: Vec<(String, TaskHandler)> = {
            let tasks = self.lock_tasks();
            tasks
                .values()
                .filter(|t| t.enabled && t.next_run.is_some_and(|n| n <= now))
                .map(|t| (t.name.clone(), t.handler.clone()))
                .collect()
        };

        for (name, handler) in due {
            info!("running task '{name}'");
            let (success, error) = match run_handler(&handler) {
                Ok(()) => (true, None),
                Err(msg) => {
                    error!("task '{name}' failed: {msg}");
                    (false, Some(msg))
                }
            };

            let mut tasks = self.lock_tasks();
            if let Some(task) = tasks.get_mut(&name) {
                task.last_run = Some(now);
                match task.cron.next_run(now) {
                    Ok(next) => {
                        task.next_run = Some(next);
                        info!("task '{name}' next run: {next}");
                    }
                    Err(e) => {
                        error!("cannot compute next run for task '{name}': {e}");
                        task.enabled = false;
                        task.next_run = None;
                    }
                }
            }
            drop(tasks);

            results.push(TaskRunResult {
                name,
                success,
                error,
            });
        }

        results
    }

    /// Run the scheduler until [`Scheduler::stop`] is called.
    ///
    /// Sleeps in 1-second increments between checks so a stop request
    /// is observed within about a second rather than after a full
    /// `check_interval`.
    pub fn run_forever(&self, check_interval: u64) {
        self.running.store(true, Ordering::SeqCst);
        info!("scheduler started, check interval {check_interval}s");

        while self.running.load(Ordering::SeqCst) {
            // Handler panics are caught per task; this guards against a
            // panic in the check pass itself so the loop survives it.
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.check_and_run_tasks();
            }))
            .is_err()
            {
                error!("scheduler check pass panicked, continuing");
            }

            for _ in 0..check_interval {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }

        info!("scheduler stopped");
    }

    /// Request the scheduling loop to exit. Does not interrupt a task
    /// currently executing.
    pub fn stop(&self) {
        info!("stopping scheduler");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Returns `true` while the scheduling loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScheduledTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoke a handler, converting both returned errors and panics into a
/// message so one misbehaving task cannot take down the batch.
fn run_handler(handler: &TaskHandler) -> std::result::Result<(), String> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task panicked".to_owned());
            Err(format!("panic: {msg}"))
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::DaemonError;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn noop_handler() -> TaskHandler {
        Arc::new(|| Ok(()))
    }

    fn counting_handler(counter: &Arc<AtomicUsize>) -> TaskHandler {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    /// Force a task's next_run into the past so the next check fires it.
    fn make_due(scheduler: &Scheduler, name: &str) {
        let mut tasks = scheduler.lock_tasks();
        let task = tasks.get_mut(name).expect("task exists");
        task.next_run = Some(Local::now().naive_local() - ChronoDuration::minutes(1));
    }

    #[test]
    fn add_task_computes_initial_next_run() {
        let scheduler = Scheduler::new();
        scheduler
            .add_task("t", "*/5 * * * *", noop_handler())
            .unwrap();

        let status = scheduler.get_task_status("t").unwrap();
        assert!(status.enabled);
        assert!(status.last_run.is_none());
        let next = status.next_run.expect("next_run set");
        assert!(next > Local::now().naive_local() - ChronoDuration::minutes(1));
    }

    #[test]
    fn add_task_rejects_malformed_cron_at_registration() {
        let scheduler = Scheduler::new();
        let err = scheduler
            .add_task("bad", "not a cron", noop_handler())
            .unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
        assert!(scheduler.get_task_status("bad").is_none());
    }

    #[test]
    fn add_task_replaces_existing_name() {
        let scheduler = Scheduler::new();
        scheduler.add_task("t", "0 * * * *", noop_handler()).unwrap();
        scheduler
            .add_task("t", "*/10 * * * *", noop_handler())
            .unwrap();

        assert_eq!(scheduler.get_all_tasks_status().len(), 1);
        assert_eq!(
            scheduler.get_task_status("t").unwrap().schedule,
            "*/10 * * * *"
        );
    }

    #[test]
    fn due_task_runs_exactly_once_and_reschedules() {
        let scheduler = Scheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task("t", "* * * * *", counting_handler(&calls))
            .unwrap();
        make_due(&scheduler, "t");

        let triggered_next = scheduler.next_run_of("t").unwrap();
        let results = scheduler.check_and_run_tasks();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 1);
        assert!(results[0].success);

        let status = scheduler.get_task_status("t").unwrap();
        assert!(status.last_run.is_some());
        assert!(status.next_run.unwrap() > triggered_next);

        // Not due again until the new next_run arrives.
        scheduler.check_and_run_tasks();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_handler_still_records_run_and_reschedules() {
        let scheduler = Scheduler::new();
        scheduler
            .add_task(
                "t",
                "* * * * *",
                Arc::new(|| Err(DaemonError::Task("boom".to_owned()))),
            )
            .unwrap();
        make_due(&scheduler, "t");

        let results = scheduler.check_and_run_tasks();
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("boom"));

        let status = scheduler.get_task_status("t").unwrap();
        assert!(status.last_run.is_some());
        assert!(status.next_run.is_some());
        assert!(status.enabled);
    }

    #[test]
    fn panicking_handler_does_not_abort_the_batch() {
        let scheduler = Scheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task("a_panics", "* * * * *", Arc::new(|| panic!("kaboom")))
            .unwrap();
        scheduler
            .add_task("b_runs", "* * * * *", counting_handler(&calls))
            .unwrap();
        make_due(&scheduler, "a_panics");
        make_due(&scheduler, "b_runs");

        let results = scheduler.check_and_run_tasks();
        assert_eq!(results.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let panicked = results.iter().find(|r| r.name == "a_panics").unwrap();
        assert!(!panicked.success);
        assert!(panicked.error.as_deref().unwrap().contains("kaboom"));
    }

    #[test]
    fn two_due_tasks_both_run_exactly_once() {
        let scheduler = Scheduler::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task("a", "* * * * *", counting_handler(&a))
            .unwrap();
        scheduler
            .add_task("b", "* * * * *", counting_handler(&b))
            .unwrap();
        make_due(&scheduler, "a");
        make_due(&scheduler, "b");

        let results = scheduler.check_and_run_tasks();
        assert_eq!(results.len(), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disabled_task_does_not_run() {
        let scheduler = Scheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task("t", "* * * * *", counting_handler(&calls))
            .unwrap();
        make_due(&scheduler, "t");
        scheduler.disable_task("t");

        scheduler.check_and_run_tasks();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        scheduler.enable_task("t");
        scheduler.check_and_run_tasks();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_task_drops_it() {
        let scheduler = Scheduler::new();
        scheduler.add_task("t", "* * * * *", noop_handler()).unwrap();
        scheduler.remove_task("t");
        assert!(scheduler.get_task_status("t").is_none());
        // Unknown names are ignored.
        scheduler.remove_task("t");
    }

    #[test]
    fn recompute_failure_disables_task() {
        let scheduler = Scheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task("t", "* * * * *", counting_handler(&calls))
            .unwrap();
        {
            let mut tasks = scheduler.lock_tasks();
            let task = tasks.get_mut("t").expect("task exists");
            // February 31st never exists, so rescheduling after this
            // run cannot succeed.
            task.cron = CronSchedule::parse("0 0 31 2 *").unwrap();
            task.next_run = Some(Local::now().naive_local() - ChronoDuration::minutes(1));
        }

        let results = scheduler.check_and_run_tasks();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results[0].success);

        let status = scheduler.get_task_status("t").unwrap();
        assert!(!status.enabled);
        assert!(status.next_run.is_none());
        assert!(status.last_run.is_some());

        // Left inert: it never fires again.
        scheduler.check_and_run_tasks();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_forever_continues_after_panicking_pass() {
        let scheduler = Arc::new(Scheduler::new());
        let calls = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task("panics", "* * * * *", Arc::new(|| panic!("kaboom")))
            .unwrap();
        scheduler
            .add_task("counts", "* * * * *", counting_handler(&calls))
            .unwrap();
        make_due(&scheduler, "panics");
        make_due(&scheduler, "counts");

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            std::thread::spawn(move || scheduler.run_forever(1))
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) == 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "loop died before running the surviving task"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(scheduler.is_running());

        scheduler.stop();
        handle.join().unwrap();
    }

    #[test]
    fn stop_flag_bounds_run_forever() {
        let scheduler = Arc::new(Scheduler::new());
        let handle = {
            let scheduler = Arc::clone(&scheduler);
            std::thread::spawn(move || scheduler.run_forever(60))
        };

        // Wait for the loop to start, then stop it.
        while !scheduler.is_running() {
            std::thread::sleep(Duration::from_millis(10));
        }
        let started = std::time::Instant::now();
        scheduler.stop();
        handle.join().unwrap();

        // Shutdown latency is bounded near one second, not a full
        // 60-second check interval.
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
