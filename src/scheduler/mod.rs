//! Cron-like task scheduling.
//!
//! [`cron`] parses 5-field cron expressions and computes next-run
//! times; [`runner`] owns the task map and the blocking check loop.

pub mod cron;
pub mod runner;
pub mod tasks;

pub use cron::CronSchedule;
pub use runner::Scheduler;
pub use tasks::{ScheduledTask, TaskHandler, TaskRunResult, TaskStatus};
