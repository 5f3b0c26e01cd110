//! Vigil: background-process orchestration for long-running daemons.
//!
//! This crate provides the plumbing a periodic-work daemon needs:
//! cron-style scheduling, adaptive rate limiting with exponential
//! backoff, run metrics, and an HTTP health endpoint for container
//! orchestration probes.
//!
//! # Architecture
//!
//! One blocking scheduler thread drives everything:
//! - **Scheduler**: parses 5-field cron expressions and runs due tasks
//!   sequentially
//! - **Rate limiter**: token bucket + 60s sliding window + 429 backoff
//!   around each job's work
//! - **Metrics**: mutex-guarded run aggregate with snapshot summaries
//! - **Health check**: axum server on its own worker thread serving
//!   liveness, readiness, and metrics
//! - **Daemon runner**: composition root wiring jobs, config, and
//!   reload together

pub mod config;
pub mod daemon;
pub mod error;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod scheduler;

pub use config::DaemonConfig;
pub use daemon::{DaemonRunner, Job, RunStats, WorkFn};
pub use error::{DaemonError, Result};
pub use health::{HealthCheck, HealthStatus};
pub use metrics::{DaemonMetrics, MetricsSummary, RunMetrics};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use scheduler::{CronSchedule, Scheduler};
