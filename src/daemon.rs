//! Daemon runner: wires config, scheduler, rate limiter, metrics, and
//! the health endpoint into one long-running process.
//!
//! Jobs are registered as [`Job`] values before [`DaemonRunner::run`];
//! the runner turns each into a scheduled task whose handler executes
//! the job's work under the rate limiter, folds the outcome into the
//! metrics aggregate, and reports it to the health endpoint. Live
//! components sit behind `RwLock<Arc<_>>` so a config reload can swap
//! one in without touching tasks mid-execution: a handler clones the
//! `Arc` at the start of a run and keeps using that instance even if a
//! reload replaces it concurrently.

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};
use crate::health::HealthCheck;
use crate::metrics::DaemonMetrics;
use crate::rate_limit::RateLimiter;
use crate::scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{error, info, warn};

/// Schedule for the built-in metrics push task.
const METRICS_TASK: &str = "metrics";
const METRICS_SCHEDULE: &str = "*/30 * * * *";

/// Counters a job reports back from one execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    /// Items the run processed.
    pub items_processed: u64,
    /// Remote API calls the run made.
    pub api_calls: u64,
    /// Remote API errors the run observed.
    pub api_errors: u64,
}

/// A job's unit of work.
pub type WorkFn = Arc<dyn Fn() -> Result<RunStats> + Send + Sync>;

/// A named unit of work with a default cron schedule.
///
/// The effective schedule comes from the config's `schedules` table
/// when an override exists, otherwise from `default_schedule`.
pub struct Job {
    name: String,
    default_schedule: String,
    work: WorkFn,
}

impl Job {
    /// Create a job from a name, default cron expression, and work.
    #[must_use]
    pub fn new(name: impl Into<String>, default_schedule: impl Into<String>, work: WorkFn) -> Self {
        Self {
            name: name.into(),
            default_schedule: default_schedule.into(),
            work,
        }
    }

    /// The job's name, used as its task name and schedule-override key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("default_schedule", &self.default_schedule)
            .finish_non_exhaustive()
    }
}

/// Live components shared between task handlers and the runner.
struct Components {
    config: RwLock<Arc<DaemonConfig>>,
    rate_limiter: RwLock<Arc<RateLimiter>>,
    health: RwLock<Option<Arc<HealthCheck>>>,
    metrics: Arc<DaemonMetrics>,
}

impl Components {
    fn new(config: DaemonConfig) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));
        Self {
            config: RwLock::new(Arc::new(config)),
            rate_limiter: RwLock::new(rate_limiter),
            health: RwLock::new(None),
            metrics: Arc::new(DaemonMetrics::new()),
        }
    }

    fn config(&self) -> Arc<DaemonConfig> {
        Arc::clone(
            &self
                .config
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(
            &self
                .rate_limiter
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    fn health(&self) -> Option<Arc<HealthCheck>> {
        self.health
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_health(&self, health: Option<Arc<HealthCheck>>) -> Option<Arc<HealthCheck>> {
        let mut slot = self
            .health
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::replace(&mut slot, health)
    }
}

/// Composition root tying the daemon subsystems together.
pub struct DaemonRunner {
    config_path: Option<PathBuf>,
    components: Arc<Components>,
    scheduler: Arc<Scheduler>,
    jobs: Vec<Job>,
    primary: Option<String>,
    immediate: bool,
    initialized: AtomicBool,
    torn_down: AtomicBool,
}

impl DaemonRunner {
    /// Create a runner from an in-memory configuration.
    #[must_use]
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config_path: None,
            components: Arc::new(Components::new(config)),
            scheduler: Arc::new(Scheduler::new()),
            jobs: Vec::new(),
            primary: None,
            immediate: false,
            initialized: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Create a runner from a TOML config file. The path is retained
    /// so [`DaemonRunner::reload`] can re-read it.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Config`] if the file cannot be loaded.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = DaemonConfig::load(&path)?;
        let mut runner = Self::new(config);
        runner.config_path = Some(path);
        Ok(runner)
    }

    /// Register a job. The first job registered becomes the primary:
    /// its outcomes drive the health endpoint's readiness state.
    #[must_use]
    pub fn with_job(mut self, job: Job) -> Self {
        if self.primary.is_none() {
            self.primary = Some(job.name.clone());
        }
        self.jobs.push(job);
        self
    }

    /// Run the primary job once at startup, before the schedule loop.
    #[must_use]
    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Start the health server (when enabled) and register all tasks.
    /// Idempotent: later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Health`] when the health server cannot
    /// start, or a config/scheduler error for a bad cron expression.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let config = self.components.config();
        if config.health.enabled {
            let health = Arc::new(HealthCheck::new(config.health.port));
            health.start()?;
            self.components.set_health(Some(health));
        }

        self.register_tasks(&config)?;

        if let Some(primary) = &self.primary
            && let Some(health) = self.components.health()
        {
            health.update_next_run(self.scheduler.next_run_of(primary));
        }

        info!(
            "daemon initialized with {} job(s), check interval {}s",
            self.jobs.len(),
            config.check_interval
        );
        Ok(())
    }

    /// Run the daemon until [`DaemonRunner::stop`] is called, then
    /// tear the components down.
    ///
    /// # Errors
    ///
    /// Propagates initialization failures. Job failures during the
    /// loop are recorded in metrics and health, not returned.
    pub fn run(&self) -> Result<()> {
        self.initialize()?;

        if self.immediate
            && let Some(primary) = &self.primary
        {
            info!("running primary job '{primary}' immediately");
            if let Some(handler) = self.scheduler.handler_of(primary)
                && let Err(e) = handler()
            {
                // Already recorded in metrics and health by the
                // handler itself.
                error!("immediate run of '{primary}' failed: {e}");
            }
        }

        let check_interval = self.components.config().check_interval;
        self.scheduler.run_forever(check_interval);
        self.teardown();
        Ok(())
    }

    /// Request the schedule loop to exit. Safe from any thread and
    /// from signal-handling contexts.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Re-read the config file and apply the changes.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Config`] when the runner was not built
    /// from a file or the file no longer loads. A failed reload leaves
    /// the running components untouched.
    pub fn reload(&self) -> Result<()> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| DaemonError::Config("no config file to reload from".to_owned()))?;
        let new = DaemonConfig::load(path)?;
        info!("reloading configuration from {}", path.display());
        self.apply_config(new)
    }

    /// Apply a new configuration, replacing only the components whose
    /// subsection actually changed.
    ///
    /// # Errors
    ///
    /// Returns an error when re-registering tasks or restarting the
    /// health server fails.
    pub fn apply_config(&self, new: DaemonConfig) -> Result<()> {
        let old = self.components.config();

        if new.rate_limit != old.rate_limit {
            info!("rate limit settings changed, replacing limiter");
            let mut slot = self
                .components
                .rate_limiter
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *slot = Arc::new(RateLimiter::new(new.rate_limit));
        }

        if new.health != old.health {
            info!("health settings changed, restarting health server");
            if let Some(previous) = self.components.set_health(None) {
                previous.stop();
            }
            if new.health.enabled {
                let health = Arc::new(HealthCheck::new(new.health.port));
                health.start()?;
                self.components.set_health(Some(health));
            }
        }

        if new.check_interval != old.check_interval {
            warn!(
                "check_interval changed from {}s to {}s, applies on next start",
                old.check_interval, new.check_interval
            );
        }

        let reschedule = new.schedules != old.schedules;
        {
            let mut slot = self
                .components
                .config
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *slot = Arc::new(new);
        }
        if reschedule && self.initialized.load(Ordering::SeqCst) {
            info!("schedules changed, re-registering tasks");
            let config = self.components.config();
            self.register_tasks(&config)?;
        }
        Ok(())
    }

    /// The configuration snapshot currently in effect.
    #[must_use]
    pub fn config(&self) -> Arc<DaemonConfig> {
        self.components.config()
    }

    /// Metrics aggregate, shared with all task handlers.
    #[must_use]
    pub fn metrics(&self) -> Arc<DaemonMetrics> {
        Arc::clone(&self.components.metrics)
    }

    /// The rate limiter currently in effect.
    #[must_use]
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.components.limiter()
    }

    /// The health check, when enabled and started.
    #[must_use]
    pub fn health(&self) -> Option<Arc<HealthCheck>> {
        self.components.health()
    }

    /// The task scheduler.
    #[must_use]
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Register (or re-register) one task per job plus the built-in
    /// metrics push task. `add_task` replaces existing names, so this
    /// doubles as the reschedule path.
    fn register_tasks(&self, config: &DaemonConfig) -> Result<()> {
        for job in &self.jobs {
            let schedule = config.schedule_for(&job.name, &job.default_schedule);
            let is_primary = self.primary.as_deref() == Some(job.name.as_str());
            let handler = make_job_handler(
                job.name.clone(),
                Arc::clone(&job.work),
                Arc::clone(&self.components),
                Arc::downgrade(&self.scheduler),
                is_primary,
            );
            self.scheduler.add_task(&job.name, schedule, handler)?;
        }

        let schedule = config.schedule_for(METRICS_TASK, METRICS_SCHEDULE);
        let handler = make_metrics_handler(
            Arc::clone(&self.components),
            Arc::downgrade(&self.scheduler),
            self.primary.clone(),
        );
        self.scheduler.add_task(METRICS_TASK, schedule, handler)?;
        Ok(())
    }

    /// Stop the health server exactly once, pushing a final metrics
    /// snapshot first.
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(health) = self.components.set_health(None) {
            health.update_metrics(metrics_blob(&self.components));
            health.stop();
        }
        info!("daemon shut down");
    }
}

impl Drop for DaemonRunner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Wrap a job's work into a task handler: execute under the current
/// rate limiter with retries, fold the outcome into metrics, and (for
/// the primary job) update the health endpoint.
fn make_job_handler(
    name: String,
    work: WorkFn,
    components: Arc<Components>,
    scheduler: Weak<Scheduler>,
    is_primary: bool,
) -> crate::scheduler::TaskHandler {
    Arc::new(move || {
        let mut run = components.metrics.start_run();
        let limiter = components.limiter();
        let result = limiter.execute_with_retry(|| work());

        let next_run = scheduler.upgrade().and_then(|s| s.next_run_of(&name));

        match result {
            Ok(stats) => {
                run.items_processed = stats.items_processed;
                run.api_calls = stats.api_calls;
                run.api_errors = stats.api_errors;
                components.metrics.complete_run(run, true, None);
                if is_primary && let Some(health) = components.health() {
                    health.update_successful_run(next_run);
                }
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                components.metrics.complete_run(run, false, Some(message.clone()));
                if is_primary && let Some(health) = components.health() {
                    health.update_failed_run(&message, next_run);
                }
                Err(e)
            }
        }
    })
}

/// Handler for the built-in metrics task: push the current aggregate
/// plus limiter counters to the health endpoint and refresh the
/// primary job's next-run time.
fn make_metrics_handler(
    components: Arc<Components>,
    scheduler: Weak<Scheduler>,
    primary: Option<String>,
) -> crate::scheduler::TaskHandler {
    Arc::new(move || {
        if let Some(health) = components.health() {
            health.update_metrics(metrics_blob(&components));
            if let Some(primary) = &primary
                && let Some(scheduler) = scheduler.upgrade()
            {
                health.update_next_run(scheduler.next_run_of(primary));
            }
        }
        Ok(())
    })
}

/// Daemon metrics summary with the rate limiter snapshot nested in.
fn metrics_blob(components: &Components) -> serde_json::Value {
    let mut blob = match serde_json::to_value(components.metrics.summary()) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    if let Ok(limiter) = serde_json::to_value(components.limiter().snapshot()) {
        blob.insert("rate_limiter".to_owned(), limiter);
    }
    serde_json::Value::Object(blob)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn quiet_config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.health.enabled = false;
        config.check_interval = 1;
        config
    }

    fn counting_work(counter: &Arc<AtomicUsize>) -> WorkFn {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(RunStats {
                items_processed: 3,
                api_calls: 1,
                api_errors: 0,
            })
        })
    }

    #[test]
    fn initialize_registers_job_and_metrics_tasks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = DaemonRunner::new(quiet_config())
            .with_job(Job::new("sync", "*/5 * * * *", counting_work(&calls)));

        runner.initialize().unwrap();
        let names: Vec<String> = runner
            .scheduler()
            .get_all_tasks_status()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert!(names.contains(&"sync".to_owned()));
        assert!(names.contains(&"metrics".to_owned()));

        // Idempotent.
        runner.initialize().unwrap();
        assert_eq!(runner.scheduler().get_all_tasks_status().len(), 2);
    }

    #[test]
    fn config_schedule_override_wins_over_default() {
        let mut config = quiet_config();
        config
            .schedules
            .insert("sync".to_owned(), "0 3 * * *".to_owned());
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = DaemonRunner::new(config)
            .with_job(Job::new("sync", "*/5 * * * *", counting_work(&calls)));

        runner.initialize().unwrap();
        let status = runner.scheduler().get_task_status("sync").unwrap();
        assert_eq!(status.schedule, "0 3 * * *");
    }

    #[test]
    fn job_handler_folds_stats_into_metrics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = DaemonRunner::new(quiet_config())
            .with_job(Job::new("sync", "*/5 * * * *", counting_work(&calls)));
        runner.initialize().unwrap();

        let handler = runner.scheduler().handler_of("sync").unwrap();
        handler().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let summary = runner.metrics().summary();
        assert_eq!(summary.total_runs, 1);
        assert_eq!(summary.successful_runs, 1);
        assert_eq!(summary.total_items_processed, 3);
        assert_eq!(summary.total_api_calls, 1);
    }

    #[test]
    fn failing_job_records_failure_and_returns_error() {
        let runner = DaemonRunner::new(quiet_config()).with_job(Job::new(
            "sync",
            "*/5 * * * *",
            Arc::new(|| Err(DaemonError::Task("invalid credentials".to_owned()))),
        ));
        runner.initialize().unwrap();

        let handler = runner.scheduler().handler_of("sync").unwrap();
        assert!(handler().is_err());

        let summary = runner.metrics().summary();
        assert_eq!(summary.failed_runs, 1);
        let last = summary.last_run.unwrap();
        assert!(!last.success);
        assert!(
            last.error_message
                .as_deref()
                .unwrap()
                .contains("invalid credentials")
        );
    }

    #[test]
    fn apply_config_replaces_limiter_only_when_settings_change() {
        let runner = DaemonRunner::new(quiet_config());
        let before = runner.rate_limiter();

        // Unchanged rate_limit keeps the same limiter instance.
        runner.apply_config(quiet_config()).unwrap();
        assert!(Arc::ptr_eq(&before, &runner.rate_limiter()));

        let mut changed = quiet_config();
        changed.rate_limit.requests_per_second = 1.5;
        runner.apply_config(changed).unwrap();
        let after = runner.rate_limiter();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!((after.config().requests_per_second - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn apply_config_reschedules_changed_tasks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = DaemonRunner::new(quiet_config())
            .with_job(Job::new("sync", "*/5 * * * *", counting_work(&calls)));
        runner.initialize().unwrap();

        let mut changed = quiet_config();
        changed
            .schedules
            .insert("sync".to_owned(), "0 * * * *".to_owned());
        runner.apply_config(changed).unwrap();

        let status = runner.scheduler().get_task_status("sync").unwrap();
        assert_eq!(status.schedule, "0 * * * *");
    }

    #[test]
    fn reload_without_config_path_is_an_error() {
        let runner = DaemonRunner::new(quiet_config());
        assert!(matches!(runner.reload(), Err(DaemonError::Config(_))));
    }

    #[test]
    fn stop_ends_the_run_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = Arc::new(
            DaemonRunner::new(quiet_config())
                .with_job(Job::new("sync", "*/5 * * * *", counting_work(&calls)))
                .with_immediate(true),
        );

        let handle = {
            let runner = Arc::clone(&runner);
            std::thread::spawn(move || runner.run())
        };

        // Wait for the immediate run, then stop the loop.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while runner.metrics().summary().total_runs == 0 {
            assert!(std::time::Instant::now() < deadline, "immediate run never happened");
            std::thread::sleep(Duration::from_millis(10));
        }
        while !runner.scheduler().is_running() {
            std::thread::sleep(Duration::from_millis(10));
        }
        runner.stop();
        handle.join().unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.metrics().summary().total_runs, 1);
    }
}
