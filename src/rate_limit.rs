//! Rate limiting for outbound calls made by task handlers.
//!
//! Combines three throttles behind one mutex: a token bucket refilled
//! lazily from elapsed wall-clock time, a 60-second sliding window
//! enforcing a per-minute cap, and an exponential backoff armed by 429
//! responses. [`RateLimiter::execute_with_retry`] wraps an arbitrary
//! unit of work with acquisition and substring-based retry
//! classification.

use crate::error::{DaemonError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Width of the sliding window enforcing the per-minute cap.
const WINDOW: Duration = Duration::from_secs(60);

/// How long `execute_with_retry` waits for capacity per attempt.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(300);

/// Ceiling on the transient-failure retry sleep, in seconds.
const TRANSIENT_BACKOFF_MAX_SECS: f64 = 60.0;

/// Rate limiter settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Continuous token refill rate.
    pub requests_per_second: f64,
    /// Discrete cap on requests within any 60-second window.
    pub requests_per_minute: usize,
    /// Token bucket capacity (short burst allowance).
    pub burst_size: usize,
    /// Exponential backoff multiplier for consecutive 429s.
    pub backoff_base: f64,
    /// Ceiling on the 429 backoff, in seconds.
    pub backoff_max: f64,
    /// Bound on `execute_with_retry` attempts.
    pub retry_attempts: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            requests_per_minute: 500,
            burst_size: 20,
            backoff_base: 2.0,
            backoff_max: 300.0,
            retry_attempts: 5,
        }
    }
}

/// Mutable limiter state, guarded by a single mutex.
struct LimiterState {
    /// Current token balance, clamped to `[0, burst_size]`.
    tokens: f64,
    /// When tokens were last refilled.
    last_refill: Instant,
    /// Timestamps of recent acquisitions, oldest first.
    window: VecDeque<Instant>,
    /// Consecutive 429 responses without an intervening success.
    consecutive_429s: u32,
    /// End of the active backoff period, if any.
    backoff_until: Option<Instant>,
    // Counters for the metrics snapshot.
    total_requests: u64,
    throttled_requests: u64,
    failed_requests: u64,
    total_wait_time: f64,
}

/// Token bucket rate limiter with sliding window and 429 backoff.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a limiter with a full token bucket.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let state = LimiterState {
            tokens: config.burst_size as f64,
            last_refill: Instant::now(),
            window: VecDeque::new(),
            consecutive_429s: 0,
            backoff_until: None,
            total_requests: 0,
            throttled_requests: 0,
            failed_requests: 0,
            total_wait_time: 0.0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Returns the configuration this limiter was built with.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Acquire permission to make one request, blocking up to `timeout`.
    ///
    /// Returns `false` without consuming a token when the projected wait
    /// would exceed the timeout (`None` waits indefinitely). On success
    /// one token is consumed and the acquisition is recorded in the
    /// sliding window.
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let start = Instant::now();

        loop {
            let wait = {
                let mut state = self.lock_state();
                let wait = self.required_wait(&mut state);
                if wait.is_zero() {
                    state.tokens -= 1.0;
                    state.window.push_back(Instant::now());
                    state.total_requests += 1;
                    return true;
                }
                wait
            };

            if let Some(timeout) = timeout
                && start.elapsed() + wait > timeout
            {
                return false;
            }

            debug!("rate limiter waiting {:.2}s for capacity", wait.as_secs_f64());
            {
                let mut state = self.lock_state();
                state.throttled_requests += 1;
                state.total_wait_time += wait.as_secs_f64();
            }
            std::thread::sleep(wait);
        }
    }

    /// Record a 429 response and arm exponential backoff.
    ///
    /// Each successive unresolved 429 strictly increases the delay
    /// until `backoff_max` is reached, after which it is constant.
    pub fn handle_429(&self) {
        let mut state = self.lock_state();
        state.consecutive_429s += 1;
        // Clamped below zero so a misconfigured negative base cannot
        // produce a negative duration.
        let backoff = self
            .config
            .backoff_base
            .powi(state.consecutive_429s as i32)
            .min(self.config.backoff_max)
            .max(0.0);
        state.backoff_until = Some(Instant::now() + Duration::from_secs_f64(backoff));
        warn!(
            "rate limit exceeded (429), backing off {backoff:.1}s (attempt {})",
            state.consecutive_429s
        );
    }

    /// Clear backoff state after a clean success.
    pub fn reset_backoff(&self) {
        let mut state = self.lock_state();
        if state.consecutive_429s > 0 {
            info!(
                "resetting backoff after {} 429 responses",
                state.consecutive_429s
            );
            state.consecutive_429s = 0;
            state.backoff_until = None;
        }
    }

    /// Execute a unit of work under rate limiting with bounded retries.
    ///
    /// Failures are classified by case-insensitive substrings of their
    /// display form: "429" / "rate limit" / "too many requests" arm the
    /// 429 backoff and retry; "503" / "502" / "timeout" sleep a small
    /// capped backoff and retry; anything else is fatal and returned
    /// immediately. Exhausting all attempts returns the last error.
    ///
    /// # Errors
    ///
    /// [`DaemonError::RateLimit`] when capacity cannot be acquired
    /// within the per-attempt timeout; otherwise the work's own error.
    pub fn execute_with_retry<T, F>(&self, mut work: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut last_error = None;

        for attempt in 1..=self.config.retry_attempts {
            if !self.acquire(Some(ACQUIRE_TIMEOUT)) {
                return Err(DaemonError::RateLimit(
                    "timed out waiting for capacity".to_owned(),
                ));
            }

            match work() {
                Ok(value) => {
                    self.reset_backoff();
                    return Ok(value);
                }
                Err(e) => {
                    let msg = e.to_string().to_lowercase();

                    if msg.contains("429")
                        || msg.contains("rate limit")
                        || msg.contains("too many requests")
                    {
                        self.handle_429();
                        warn!(
                            "attempt {attempt}/{} failed with rate limit",
                            self.config.retry_attempts
                        );
                        last_error = Some(e);
                        continue;
                    }

                    if msg.contains("503") || msg.contains("502") || msg.contains("timeout") {
                        let wait = self
                            .config
                            .backoff_base
                            .powi(attempt as i32)
                            .min(TRANSIENT_BACKOFF_MAX_SECS)
                            .max(0.0);
                        warn!(
                            "attempt {attempt}/{} failed: {e}, retrying in {wait:.1}s",
                            self.config.retry_attempts
                        );
                        std::thread::sleep(Duration::from_secs_f64(wait));
                        last_error = Some(e);
                        continue;
                    }

                    self.lock_state().failed_requests += 1;
                    return Err(e);
                }
            }
        }

        self.lock_state().failed_requests += 1;
        error!(
            "all {} retry attempts exhausted",
            self.config.retry_attempts
        );
        Err(last_error.unwrap_or_else(|| {
            DaemonError::RateLimit("all retry attempts exhausted".to_owned())
        }))
    }

    /// Snapshot of limiter counters and current throttle state.
    #[must_use]
    pub fn snapshot(&self) -> RateLimiterMetrics {
        let mut state = self.lock_state();
        let now = Instant::now();
        self.refill_tokens(&mut state, now);
        prune_window(&mut state.window, now);

        RateLimiterMetrics {
            total_requests: state.total_requests,
            throttled_requests: state.throttled_requests,
            failed_requests: state.failed_requests,
            total_wait_time: state.total_wait_time,
            current_rpm: state.window.len(),
            current_tokens: state.tokens,
            consecutive_429s: state.consecutive_429s,
            in_backoff: state.backoff_until.is_some_and(|until| until > now),
            backoff_remaining: state
                .backoff_until
                .map_or(0.0, |until| until.saturating_duration_since(now).as_secs_f64()),
        }
    }

    /// Largest of the three required waits: token refill, window
    /// aging, and active backoff. A zero result means capacity is
    /// available right now.
    fn required_wait(&self, state: &mut LimiterState) -> Duration {
        let now = Instant::now();
        let mut wait = Duration::ZERO;

        if let Some(until) = state.backoff_until {
            if until > now {
                wait = until - now;
            } else {
                // Backoff period ended.
                state.backoff_until = None;
                state.consecutive_429s = 0;
            }
        }

        self.refill_tokens(state, now);
        if state.tokens < 1.0 && self.config.requests_per_second > 0.0 {
            let needed = 1.0 - state.tokens;
            let token_wait = Duration::from_secs_f64(needed / self.config.requests_per_second);
            wait = wait.max(token_wait);
        }

        prune_window(&mut state.window, now);
        if state.window.len() >= self.config.requests_per_minute
            && let Some(&oldest) = state.window.front()
        {
            let remaining = WINDOW.saturating_sub(now.duration_since(oldest));
            wait = wait.max(remaining);
        }

        wait
    }

    fn refill_tokens(&self, state: &mut LimiterState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let added = elapsed.as_secs_f64() * self.config.requests_per_second;
        state.tokens = (state.tokens + added).min(self.config.burst_size as f64);
        state.last_refill = now;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Drop window entries older than 60 seconds.
fn prune_window(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&front) = window.front() {
        if now.duration_since(front) >= WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Serializable limiter metrics, folded into the daemon metrics blob.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterMetrics {
    /// Requests granted since construction.
    pub total_requests: u64,
    /// Acquisitions that had to wait at least once.
    pub throttled_requests: u64,
    /// Work executions that ended in a fatal or exhausted error.
    pub failed_requests: u64,
    /// Cumulative seconds spent waiting for capacity.
    pub total_wait_time: f64,
    /// Acquisitions within the last 60 seconds.
    pub current_rpm: usize,
    /// Current token balance.
    pub current_tokens: f64,
    /// Consecutive unresolved 429 responses.
    pub consecutive_429s: u32,
    /// Whether a 429 backoff is currently active.
    pub in_backoff: bool,
    /// Seconds of backoff remaining, 0 when inactive.
    pub backoff_remaining: f64,
}
