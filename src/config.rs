//! Configuration types for the daemon core.
//!
//! Configuration is treated as an immutable snapshot: the runner reads
//! an [`DaemonConfig`] once at startup and swaps in a whole new snapshot
//! on reload, so a task reading settings mid-execution never observes a
//! torn value. Subsections derive `PartialEq` so a reload can replace
//! only the components whose settings actually changed.

use crate::error::{DaemonError, Result};
use crate::rate_limit::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between scheduler checks for due tasks.
    pub check_interval: u64,
    /// Task name → cron expression overrides. A job without an entry
    /// here runs on the default schedule it was registered with.
    pub schedules: HashMap<String, String>,
    /// Rate limiter settings for outbound calls made by task handlers.
    pub rate_limit: RateLimitConfig,
    /// Health check HTTP server settings.
    pub health: HealthConfig,
    /// Output retention settings, consumed by a collaborator cleanup
    /// task rather than by the daemon core itself.
    pub output: OutputConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            check_interval: 60,
            schedules: HashMap::new(),
            rate_limit: RateLimitConfig::default(),
            health: HealthConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Config`] if the file cannot be read or
    /// does not parse as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|e| DaemonError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Returns the cron expression for a task, falling back to the
    /// supplied default when no override is configured.
    pub fn schedule_for<'a>(&'a self, task: &str, default: &'a str) -> &'a str {
        self.schedules.get(task).map_or(default, String::as_str)
    }
}

/// Health check HTTP server settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    /// Whether the health check server is started at all.
    pub enabled: bool,
    /// Port the health check server listens on (0 = auto-assign).
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8088,
        }
    }
}

/// Output retention settings for the collaborator cleanup task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    /// Delete output files older than this many days.
    pub max_age_days: u64,
    /// Keep at most this many files per output type.
    pub max_files_per_type: usize,
    /// Whether output files are written compressed.
    pub compress: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_files_per_type: 100,
            compress: false,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = DaemonConfig::default();
        assert_eq!(config.check_interval, 60);
        assert!(config.schedules.is_empty());
        assert!(config.health.enabled);
        assert_eq!(config.health.port, 8088);
        assert_eq!(config.output.max_age_days, 30);
        assert_eq!(config.output.max_files_per_type, 100);
        assert!(!config.output.compress);
    }

    #[test]
    fn load_parses_partial_toml_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
check_interval = 30

[schedules]
sync = "*/5 * * * *"

[rate_limit]
requests_per_second = 2.5

[health]
port = 9090
"#
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).expect("load");
        assert_eq!(config.check_interval, 30);
        assert_eq!(config.schedules.get("sync").unwrap(), "*/5 * * * *");
        assert!((config.rate_limit.requests_per_second - 2.5).abs() < f64::EPSILON);
        // Unspecified fields keep their defaults.
        assert_eq!(config.rate_limit.burst_size, 20);
        assert_eq!(config.health.port, 9090);
        assert!(config.health.enabled);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = DaemonConfig::load("/nonexistent/vigil.toml").unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn load_malformed_toml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "check_interval = [not toml").unwrap();
        let err = DaemonConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn schedule_for_prefers_override() {
        let mut config = DaemonConfig::default();
        config
            .schedules
            .insert("sync".to_owned(), "0 * * * *".to_owned());
        assert_eq!(config.schedule_for("sync", "*/5 * * * *"), "0 * * * *");
        assert_eq!(config.schedule_for("cleanup", "0 2 * * *"), "0 2 * * *");
    }
}
