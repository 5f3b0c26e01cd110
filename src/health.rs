//! Health check HTTP endpoint for container orchestration probes.
//!
//! The server runs on a dedicated worker thread with its own
//! current-thread tokio runtime, so the blocking scheduler loop never
//! shares an executor with it. Writers (the scheduling thread) and
//! readers (HTTP handlers) go through the same lock.
//!
//! ## Routes
//!
//! - `GET /health`, `/healthz` — liveness; 200 whenever the process
//!   can respond, regardless of task failures
//! - `GET /ready`, `/readiness` — readiness snapshot; 503 only when
//!   status is `unhealthy`
//! - `GET /metrics` — timestamp/uptime merged with the last pushed
//!   metrics blob

use crate::error::{DaemonError, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Consecutive failures at which readiness flips to unhealthy.
const UNHEALTHY_THRESHOLD: u32 = 5;

/// Health check status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No recent failures.
    Healthy,
    /// One to four consecutive failures.
    Degraded,
    /// Five or more consecutive failures.
    Unhealthy,
}

/// Mutable health state shared between the scheduling thread and the
/// HTTP worker.
struct HealthState {
    status: HealthStatus,
    last_successful_run: Option<chrono::DateTime<Utc>>,
    last_failed_run: Option<chrono::DateTime<Utc>>,
    next_scheduled_run: Option<NaiveDateTime>,
    consecutive_failures: u32,
    error_message: Option<String>,
    metrics: serde_json::Value,
}

struct HealthShared {
    started_at: Instant,
    state: Mutex<HealthState>,
}

impl HealthShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

/// Handle to the background server worker.
struct ServerWorker {
    shutdown: oneshot::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

/// HTTP health check endpoint owning its worker thread.
pub struct HealthCheck {
    port: u16,
    bound_port: AtomicU16,
    shared: Arc<HealthShared>,
    worker: Mutex<Option<ServerWorker>>,
}

impl HealthCheck {
    /// Create a health check bound to the given port (0 = auto-assign).
    /// The server does not listen until [`HealthCheck::start`].
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bound_port: AtomicU16::new(0),
            shared: Arc::new(HealthShared {
                started_at: Instant::now(),
                state: Mutex::new(HealthState {
                    status: HealthStatus::Healthy,
                    last_successful_run: None,
                    last_failed_run: None,
                    next_scheduled_run: None,
                    consecutive_failures: 0,
                    error_message: None,
                    metrics: serde_json::Value::Object(serde_json::Map::new()),
                }),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the HTTP server on its worker thread. Idempotent: a
    /// second call while running warns and returns Ok.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Health`] when the runtime cannot be
    /// built or the listener cannot bind.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.lock_worker();
        if worker.is_some() {
            warn!("health check server already running");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u16>>();
        let shared = Arc::clone(&self.shared);
        let port = self.port;

        let thread = std::thread::Builder::new()
            .name("vigil-health".to_owned())
            .spawn(move || serve_on_thread(shared, port, shutdown_rx, &ready_tx))
            .map_err(|e| DaemonError::Health(format!("cannot spawn worker thread: {e}")))?;

        let bound = ready_rx
            .recv()
            .map_err(|_| DaemonError::Health("worker thread exited before binding".to_owned()))??;
        self.bound_port.store(bound, Ordering::SeqCst);

        *worker = Some(ServerWorker {
            shutdown: shutdown_tx,
            thread,
        });
        info!("health check server listening on port {bound}");
        Ok(())
    }

    /// Stop the HTTP server and join its worker thread. Idempotent.
    pub fn stop(&self) {
        let worker = self.lock_worker().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(());
            if worker.thread.join().is_err() {
                error!("health check worker thread panicked");
            }
            info!("health check server stopped");
        }
    }

    /// Port the server is actually listening on (resolves port 0), or
    /// the configured port when not started.
    #[must_use]
    pub fn port(&self) -> u16 {
        let bound = self.bound_port.load(Ordering::SeqCst);
        if bound != 0 { bound } else { self.port }
    }

    /// Current readiness status.
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.shared.lock().status
    }

    /// Record a successful run: status returns to healthy and the
    /// failure counter resets, irrespective of prior failure depth.
    pub fn update_successful_run(&self, next_run: Option<NaiveDateTime>) {
        let mut state = self.shared.lock();
        state.last_successful_run = Some(Utc::now());
        state.consecutive_failures = 0;
        state.error_message = None;
        state.next_scheduled_run = next_run;
        if state.status != HealthStatus::Healthy {
            info!("health status restored to healthy");
            state.status = HealthStatus::Healthy;
        }
    }

    /// Record a failed run and recompute status from the consecutive
    /// failure count.
    pub fn update_failed_run(&self, error_message: &str, next_run: Option<NaiveDateTime>) {
        let mut state = self.shared.lock();
        state.last_failed_run = Some(Utc::now());
        state.consecutive_failures += 1;
        state.error_message = Some(error_message.to_owned());
        state.next_scheduled_run = next_run;

        let new_status = if state.consecutive_failures >= UNHEALTHY_THRESHOLD {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        if new_status != state.status {
            warn!(
                "health status changed after {} consecutive failures",
                state.consecutive_failures
            );
            state.status = new_status;
        }
    }

    /// Replace the metrics blob served at `/metrics`.
    pub fn update_metrics(&self, metrics: serde_json::Value) {
        self.shared.lock().metrics = metrics;
    }

    /// Update the next scheduled run time shown in readiness output.
    pub fn update_next_run(&self, next_run: Option<NaiveDateTime>) {
        self.shared.lock().next_scheduled_run = next_run;
    }

    /// Readiness snapshot as served at `/ready`.
    #[must_use]
    pub fn readiness(&self) -> ReadinessSnapshot {
        readiness_snapshot(&self.shared)
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<ServerWorker>> {
        self.worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for HealthCheck {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker thread body: build a runtime, bind, report, serve until
/// shutdown.
fn serve_on_thread(
    shared: Arc<HealthShared>,
    port: u16,
    shutdown_rx: oneshot::Receiver<()>,
    ready_tx: &std::sync::mpsc::Sender<Result<u16>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(DaemonError::Health(format!(
                "cannot build runtime: {e}"
            ))));
            return;
        }
    };

    runtime.block_on(async {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = ready_tx.send(Err(DaemonError::Health(format!(
                    "cannot bind port {port}: {e}"
                ))));
                return;
            }
        };
        let bound = listener.local_addr().map_or(port, |addr| addr.port());
        let _ = ready_tx.send(Ok(bound));

        let app = router(shared);
        let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = serve.await {
            error!("health check server error: {e}");
        }
    });
}

fn router(shared: Arc<HealthShared>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/healthz", get(handle_health))
        .route("/ready", get(handle_readiness))
        .route("/readiness", get(handle_readiness))
        .route("/metrics", get(handle_metrics))
        .with_state(shared)
}

/// Liveness response body.
#[derive(Debug, Clone, Serialize)]
struct LivenessResponse {
    status: &'static str,
    timestamp: String,
    uptime_seconds: f64,
}

/// Readiness response body.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessSnapshot {
    /// Current status: healthy, degraded, or unhealthy.
    pub status: HealthStatus,
    /// Time the snapshot was taken, RFC 3339.
    pub timestamp: String,
    /// Seconds since the health check was created.
    pub uptime_seconds: f64,
    /// Last successful run, RFC 3339.
    pub last_successful_run: Option<String>,
    /// Last failed run, RFC 3339.
    pub last_failed_run: Option<String>,
    /// Next scheduled run.
    pub next_scheduled_run: Option<NaiveDateTime>,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Error from the most recent failure.
    pub error_message: Option<String>,
}

fn readiness_snapshot(shared: &HealthShared) -> ReadinessSnapshot {
    let state = shared.lock();
    ReadinessSnapshot {
        status: state.status,
        timestamp: Utc::now().to_rfc3339(),
        uptime_seconds: shared.uptime_seconds(),
        last_successful_run: state.last_successful_run.map(|t| t.to_rfc3339()),
        last_failed_run: state.last_failed_run.map(|t| t.to_rfc3339()),
        next_scheduled_run: state.next_scheduled_run,
        consecutive_failures: state.consecutive_failures,
        error_message: state.error_message.clone(),
    }
}

/// `GET /health` — liveness probe.
async fn handle_health(State(shared): State<Arc<HealthShared>>) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive",
        timestamp: Utc::now().to_rfc3339(),
        uptime_seconds: shared.uptime_seconds(),
    })
}

/// `GET /ready` — readiness probe.
async fn handle_readiness(
    State(shared): State<Arc<HealthShared>>,
) -> (StatusCode, Json<ReadinessSnapshot>) {
    let snapshot = readiness_snapshot(&shared);
    let code = if snapshot.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(snapshot))
}

/// `GET /metrics` — uptime merged with the last pushed metrics blob.
async fn handle_metrics(State(shared): State<Arc<HealthShared>>) -> Json<serde_json::Value> {
    let mut payload = serde_json::Map::new();
    payload.insert(
        "timestamp".to_owned(),
        serde_json::Value::String(Utc::now().to_rfc3339()),
    );
    payload.insert(
        "uptime_seconds".to_owned(),
        serde_json::json!(shared.uptime_seconds()),
    );

    let state = shared.lock();
    if let serde_json::Value::Object(blob) = &state.metrics {
        for (key, value) in blob {
            payload.insert(key.clone(), value.clone());
        }
    }
    Json(serde_json::Value::Object(payload))
}
