//! Circuit breaker guarding the upstream.
//!
//! ```text
//!            failure_threshold consecutive failures
//!   CLOSED ───────────────────────────────────────────▶ OPEN
//!     ▲                                                  │
//!     │ success_threshold successes      reset_timeout   │
//!     │                                  since failure   ▼
//!     └──────────────────────────────────────────── HALF_OPEN
//!                     any failure → OPEN
//! ```
//!
//! While open, calls fail fast with [`Error::CircuitOpen`] without running
//! the operation.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, ErrorKind, Result};

/// Transitions kept in [`CircuitMetrics::state_changes`].
const STATE_HISTORY: usize = 50;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected.
    Open,
    /// Trial calls pass through; one failure reopens.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Thresholds for [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` that close it.
    pub success_threshold: u32,
    /// Time after the last failure before a trial call is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// One recorded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State before.
    pub from: CircuitState,
    /// State after.
    pub to: CircuitState,
    /// When it happened.
    pub at: Instant,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitMetrics {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted in the current state.
    pub failures: u32,
    /// Consecutive successes counted in the current state.
    pub successes: u32,
    /// Last counted failure.
    pub last_failure: Option<Instant>,
    /// Last success.
    pub last_success: Option<Instant>,
    /// Most recent transitions, oldest first.
    pub state_changes: Vec<StateChange>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
    state_changes: VecDeque<StateChange>,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
                last_success: None,
                state_changes: VecDeque::with_capacity(STATE_HISTORY),
            }),
        }
    }

    /// Breaker name, used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open breaker whose reset timeout has passed still
    /// reports `Open` until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of counters and history.
    pub fn metrics(&self) -> CircuitMetrics {
        let inner = self.inner.lock();
        CircuitMetrics {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            last_failure: inner.last_failure,
            last_success: inner.last_success,
            state_changes: inner.state_changes.iter().copied().collect(),
        }
    }

    /// Runs `operation` if the breaker admits it and records the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] without running `operation` while open;
    /// otherwise whatever `operation` returns.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        let outcome = operation().await;
        self.record(&outcome);
        outcome
    }

    /// Admits one call, moving an expired open breaker to `HalfOpen`.
    pub(crate) fn admit(&self) -> Result<()> {
        self.try_acquire()
    }

    /// Records the outcome of a call admitted by [`CircuitBreaker::admit`].
    pub(crate) fn record<T>(&self, outcome: &Result<T>) {
        match outcome {
            Ok(_) => self.on_success(),
            Err(err) => self.on_failure(err),
        }
    }

    /// Forces the breaker closed with counters reset.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failures = 0;
        inner.successes = 0;
    }

    fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }
        let since_failure = inner
            .last_failure
            .map_or(self.config.reset_timeout, |at| at.elapsed());
        if since_failure >= self.config.reset_timeout {
            self.transition(&mut inner, CircuitState::HalfOpen);
            Ok(())
        } else {
            Err(Error::CircuitOpen {
                name: self.name.clone(),
                retry_after: self.config.reset_timeout - since_failure,
            })
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.last_success = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
                inner.successes = inner.successes.saturating_add(1);
            }
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A call admitted before the breaker opened; it changes nothing.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, err: &Error) {
        // Rejected input or credentials, not an unhealthy upstream.
        if matches!(
            err.kind(),
            ErrorKind::Validation | ErrorKind::Client | ErrorKind::Auth
        ) {
            return;
        }
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                inner.successes = 0;
                if inner.failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.failures += 1;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Closed => {
                inner.failures = 0;
                inner.successes = 0;
            }
            CircuitState::HalfOpen | CircuitState::Open => inner.successes = 0,
        }
        if inner.state_changes.len() == STATE_HISTORY {
            inner.state_changes.pop_front();
        }
        inner.state_changes.push_back(StateChange {
            from,
            to,
            at: Instant::now(),
        });

        if to == CircuitState::Open {
            warn!(
                breaker = %self.name,
                %from,
                failures = inner.failures,
                reset_timeout_ms = self.config.reset_timeout.as_millis(),
                "circuit opened"
            );
        } else {
            info!(breaker = %self.name, %from, %to, "circuit state changed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use test_case::test_case;

    use super::*;
    use crate::error::UpstreamError;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                reset_timeout: Duration::from_secs(10),
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Err(UpstreamError::from_status(500, "down").into()) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let b = breaker();
        for _ in 0..2 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let b = breaker();
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        succeed(&b).await.unwrap();
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.metrics().failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_fails_fast_without_running() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        let runs = AtomicU32::new(0);
        let err = b
            .call(|| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        let Error::CircuitOpen { name, retry_after } = err else {
            unreachable!();
        };
        assert_eq!(name, "test");
        assert_eq!(retry_after, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_successes() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);

        let metrics = b.metrics();
        assert_eq!(metrics.failures, 0);
        assert_eq!(metrics.successes, 0);
        let path: Vec<_> = metrics.state_changes.iter().map(|c| c.to).collect();
        assert_eq!(
            path,
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(succeed(&b).await, Err(Error::CircuitOpen { .. })));
    }

    #[test_case(Error::validation("empty query") ; "validation")]
    #[test_case(Error::from(UpstreamError::from_status(400, "bad request")) ; "client")]
    #[test_case(Error::from(UpstreamError::from_status(401, "bad key")) ; "auth")]
    #[tokio::test(start_paused = true)]
    async fn test_caller_errors_do_not_count(err: Error) {
        let b = breaker();
        for _ in 0..5 {
            let err = err.clone();
            let _ = b.call(|| async move { Err::<(), _>(err) }).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.metrics().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limits_count() {
        let b = breaker();
        for _ in 0..3 {
            let limited = Error::from(UpstreamError::from_status(429, "slow down"));
            let _ = b.call(|| async move { Err::<(), _>(limited) }).await;
        }
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_bounded() {
        let b = CircuitBreaker::new(
            "flappy",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                reset_timeout: Duration::from_millis(1),
            },
        );
        for _ in 0..40 {
            let _ = fail(&b).await;
            tokio::time::advance(Duration::from_millis(1)).await;
            let _ = succeed(&b).await;
        }
        assert_eq!(b.metrics().state_changes.len(), STATE_HISTORY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        succeed(&b).await.unwrap();
    }
}
