//! Vigil daemon entrypoint.
//!
//! Runs the scheduler on a worker thread and keeps the main thread on
//! signal duty: Ctrl-C (or SIGTERM) stops the daemon, SIGHUP reloads
//! the configuration file in place.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil::config::OutputConfig;
use vigil::{DaemonConfig, DaemonRunner, Job, RunStats};

/// Vigil: background-process orchestration daemon.
#[derive(Parser)]
#[command(name = "vigild", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run the primary job once immediately at startup.
    #[arg(long)]
    immediate: bool,

    /// Directory the cleanup task prunes.
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to our own info logs; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info")),
        )
        .init();

    let cli = Cli::parse();

    let runner = match &cli.config {
        Some(path) => DaemonRunner::from_path(path)?,
        None => DaemonRunner::new(DaemonConfig::default()),
    };

    let heartbeat = Job::new(
        "heartbeat",
        "*/5 * * * *",
        Arc::new(|| {
            info!("heartbeat");
            Ok(RunStats {
                items_processed: 1,
                ..RunStats::default()
            })
        }),
    );

    // Retention settings are captured at startup; a reload that only
    // changes [output] takes effect on the next restart.
    let retention = runner.config().output;
    let output_dir = cli.output_dir.clone();
    let cleanup = Job::new(
        "cleanup",
        "0 2 * * *",
        Arc::new(move || {
            let deleted = prune_output(&output_dir, retention)?;
            Ok(RunStats {
                items_processed: deleted,
                ..RunStats::default()
            })
        }),
    );

    let runner = Arc::new(
        runner
            .with_job(heartbeat)
            .with_job(cleanup)
            .with_immediate(cli.immediate),
    );
    runner.initialize()?;

    let worker = {
        let runner = Arc::clone(&runner);
        std::thread::Builder::new()
            .name("vigil-scheduler".to_owned())
            .spawn(move || runner.run())?
    };

    wait_for_signals(&runner).await;

    runner.stop();
    match worker.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("scheduler thread panicked"),
    }
    Ok(())
}

/// Block until a shutdown signal arrives, reloading on SIGHUP.
#[cfg(unix)]
async fn wait_for_signals(runner: &Arc<DaemonRunner>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot install SIGHUP handler: {e}");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl-C, shutting down");
                return;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                return;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading configuration");
                if let Err(e) = runner.reload() {
                    warn!("reload failed, keeping current configuration: {e}");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_runner: &Arc<DaemonRunner>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("received Ctrl-C, shutting down");
}

/// Delete stale output files: first anything older than
/// `max_age_days`, then the oldest beyond `max_files_per_type` within
/// each extension group. Returns the number of files deleted.
fn prune_output(dir: &Path, retention: OutputConfig) -> vigil::Result<u64> {
    if !dir.is_dir() {
        return Ok(0);
    }

    let cutoff = SystemTime::now() - Duration::from_secs(retention.max_age_days * 24 * 3600);
    let mut by_type: std::collections::HashMap<String, Vec<(PathBuf, SystemTime)>> =
        std::collections::HashMap::new();
    let mut deleted = 0u64;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };

        if modified < cutoff {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("cannot delete {}: {e}", path.display());
            } else {
                deleted += 1;
            }
            continue;
        }

        let kind = path
            .extension()
            .map_or_else(String::new, |e| e.to_string_lossy().into_owned());
        by_type.entry(kind).or_default().push((path, modified));
    }

    for (kind, mut files) in by_type {
        if files.len() <= retention.max_files_per_type {
            continue;
        }
        // Newest first; everything past the cap goes.
        files.sort_by(|a, b| b.1.cmp(&a.1));
        for (path, _) in files.drain(retention.max_files_per_type..) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("cannot delete {}: {e}", path.display());
            } else {
                deleted += 1;
            }
        }
        info!("pruned '{kind}' files beyond retention cap");
    }

    if deleted > 0 {
        info!("cleanup removed {deleted} file(s) from {}", dir.display());
    }
    Ok(deleted)
}
