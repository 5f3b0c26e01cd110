//! Run metrics aggregation.
//!
//! A [`RunMetrics`] tracks one task execution from `start_run` to
//! `complete_run`, after which it is folded into the mutex-guarded
//! [`DaemonMetrics`] aggregate and kept as the last-run detail.
//! Snapshots are generated fresh under the lock, never handed out as
//! live references, so the health check thread can read them
//! concurrently with scheduler-thread writes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing::info;

/// Counters for a single run.
#[derive(Debug, Clone)]
pub struct RunMetrics {
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run ended; set by `complete_run`.
    pub end_time: Option<DateTime<Utc>>,
    /// Items the run processed.
    pub items_processed: u64,
    /// Remote API calls the run made.
    pub api_calls: u64,
    /// Remote API errors the run observed.
    pub api_errors: u64,
    /// Wall-clock duration; set by `complete_run`.
    pub duration_seconds: f64,
    /// Whether the run succeeded.
    pub success: bool,
    /// Error description when the run failed.
    pub error_message: Option<String>,
}

/// Aggregate totals guarded by the metrics mutex.
#[derive(Debug)]
struct Aggregate {
    started_at: DateTime<Utc>,
    total_runs: u64,
    successful_runs: u64,
    failed_runs: u64,
    total_items_processed: u64,
    total_api_calls: u64,
    total_api_errors: u64,
    total_duration_seconds: f64,
    last_run: Option<RunMetrics>,
}

impl Aggregate {
    fn fresh() -> Self {
        Self {
            started_at: Utc::now(),
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
            total_items_processed: 0,
            total_api_calls: 0,
            total_api_errors: 0,
            total_duration_seconds: 0.0,
            last_run: None,
        }
    }
}

/// Thread-safe aggregate metrics for daemon operations.
pub struct DaemonMetrics {
    inner: Mutex<Aggregate>,
}

impl DaemonMetrics {
    /// Create an empty aggregate stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Aggregate::fresh()),
        }
    }

    /// Start tracking a new run.
    #[must_use]
    pub fn start_run(&self) -> RunMetrics {
        RunMetrics {
            start_time: Utc::now(),
            end_time: None,
            items_processed: 0,
            api_calls: 0,
            api_errors: 0,
            duration_seconds: 0.0,
            success: true,
            error_message: None,
        }
    }

    /// Finalize a run and fold it into the aggregate.
    pub fn complete_run(&self, mut run: RunMetrics, success: bool, error_message: Option<String>) {
        let end = Utc::now();
        run.end_time = Some(end);
        run.duration_seconds = (end - run.start_time).num_milliseconds() as f64 / 1000.0;
        run.success = success;
        run.error_message = error_message;

        info!(
            "run completed in {:.1}s: items={}, api_calls={}, success={success}",
            run.duration_seconds, run.items_processed, run.api_calls
        );

        let mut agg = self.lock();
        agg.total_runs += 1;
        if success {
            agg.successful_runs += 1;
        } else {
            agg.failed_runs += 1;
        }
        agg.total_items_processed += run.items_processed;
        agg.total_api_calls += run.api_calls;
        agg.total_api_errors += run.api_errors;
        agg.total_duration_seconds += run.duration_seconds;
        agg.last_run = Some(run);
    }

    /// Fresh summary snapshot: totals, computed rates, last-run detail.
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let agg = self.lock();
        let uptime = (Utc::now() - agg.started_at).num_milliseconds() as f64 / 1000.0;

        let ratio = |num: u64, den: u64| if den > 0 { num as f64 / den as f64 } else { 0.0 };

        MetricsSummary {
            uptime_seconds: uptime,
            uptime_hours: uptime / 3600.0,
            total_runs: agg.total_runs,
            successful_runs: agg.successful_runs,
            failed_runs: agg.failed_runs,
            success_rate: ratio(agg.successful_runs, agg.total_runs),
            total_items_processed: agg.total_items_processed,
            total_api_calls: agg.total_api_calls,
            total_api_errors: agg.total_api_errors,
            api_error_rate: ratio(agg.total_api_errors, agg.total_api_calls),
            total_duration_seconds: agg.total_duration_seconds,
            avg_run_duration_seconds: if agg.total_runs > 0 {
                agg.total_duration_seconds / agg.total_runs as f64
            } else {
                0.0
            },
            last_run: agg.last_run.as_ref().map(LastRunSummary::from),
        }
    }

    /// Clear the aggregate and restart the uptime clock.
    pub fn reset(&self) {
        *self.lock() = Aggregate::fresh();
        info!("metrics reset");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Aggregate> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for DaemonMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable metrics summary.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    /// Seconds since the aggregate was created or reset.
    pub uptime_seconds: f64,
    /// `uptime_seconds` in hours.
    pub uptime_hours: f64,
    /// Runs folded into the aggregate.
    pub total_runs: u64,
    /// Runs that succeeded.
    pub successful_runs: u64,
    /// Runs that failed.
    pub failed_runs: u64,
    /// `successful_runs / total_runs`, 0 when no runs.
    pub success_rate: f64,
    /// Items processed across all runs.
    pub total_items_processed: u64,
    /// API calls across all runs.
    pub total_api_calls: u64,
    /// API errors across all runs.
    pub total_api_errors: u64,
    /// `total_api_errors / total_api_calls`, 0 when no calls.
    pub api_error_rate: f64,
    /// Cumulative run duration in seconds.
    pub total_duration_seconds: f64,
    /// Mean run duration in seconds, 0 when no runs.
    pub avg_run_duration_seconds: f64,
    /// Detail of the most recent run, if any.
    pub last_run: Option<LastRunSummary>,
}

/// Serializable detail of the most recent run.
#[derive(Debug, Clone, Serialize)]
pub struct LastRunSummary {
    /// Run start time, RFC 3339.
    pub start_time: String,
    /// Run end time, RFC 3339.
    pub end_time: Option<String>,
    /// Run duration in seconds.
    pub duration_seconds: f64,
    /// Items the run processed.
    pub items_processed: u64,
    /// API calls the run made.
    pub api_calls: u64,
    /// API errors the run observed.
    pub api_errors: u64,
    /// Whether the run succeeded.
    pub success: bool,
    /// Error description when the run failed.
    pub error_message: Option<String>,
}

impl From<&RunMetrics> for LastRunSummary {
    fn from(run: &RunMetrics) -> Self {
        Self {
            start_time: run.start_time.to_rfc3339(),
            end_time: run.end_time.map(|t| t.to_rfc3339()),
            duration_seconds: run.duration_seconds,
            items_processed: run.items_processed,
            api_calls: run.api_calls,
            api_errors: run.api_errors,
            success: run.success,
            error_message: run.error_message.clone(),
        }
    }
}
