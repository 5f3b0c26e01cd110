//! Error types for the daemon core.

/// Top-level error type for the daemon orchestration subsystem.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Malformed configuration (bad cron expression, unreadable file).
    #[error("config error: {0}")]
    Config(String),

    /// Scheduler error (next-run computation, task registration).
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Rate limiter could not obtain capacity within its timeout.
    #[error("rate limit error: {0}")]
    RateLimit(String),

    /// A business task handler failed. The display form of this variant
    /// feeds the retry classifier, so callers should keep status tokens
    /// like "429" or "timeout" in the message when they apply.
    #[error("task error: {0}")]
    Task(String),

    /// Health check server error (bind, runtime, serve).
    #[error("health check error: {0}")]
    Health(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, DaemonError>;
