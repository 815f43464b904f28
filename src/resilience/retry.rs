//! Retry with exponential backoff and jitter.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Decides whether a failed attempt should be retried.
///
/// Receives the error and the 1-based attempt number that produced it.
pub type RetryPredicate = Arc<dyn Fn(&Error, u32) -> bool + Send + Sync>;

/// Backoff schedule and retry eligibility.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Relative jitter in `[0, 1]`; each delay is scaled by a random factor
    /// in `1 ± jitter`.
    pub jitter: f64,
    pub(crate) predicate: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            predicate: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Replaces the default [`Error::is_retryable`] check.
    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Error, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether the failure of `attempt` warrants another try.
    #[must_use]
    pub fn should_retry(&self, err: &Error, attempt: u32) -> bool {
        self.predicate
            .as_ref()
            .map_or_else(|| err.is_retryable(), |p| p(err, attempt))
    }

    /// Delay after the failure of the 1-based `attempt`, before jitter:
    /// `min(initial × multiplier^(attempt-1), max)`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`RetryPolicy::base_delay`] with jitter drawn from `rng`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return base;
        }
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }

    fn next_delay(&self, attempt: u32, err: &Error) -> Duration {
        let delay = self.jittered_delay(attempt, &mut rand::thread_rng());
        // A server-suggested wait wins when longer, still capped.
        err.retry_after()
            .map_or(delay, |hint| delay.max(hint).min(self.max_delay))
    }

    /// Runs `operation` until it succeeds, the policy declines to retry, or
    /// attempts run out. The closure receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= max_attempts || !self.should_retry(&err, attempt) {
                        if attempt > 1 {
                            warn!(attempts = attempt, error = %err, "giving up after retries");
                        }
                        return Err(err);
                    }
                    let delay = self.next_delay(attempt, &err);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis(),
                        kind = %err.kind(),
                        error = %err,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
