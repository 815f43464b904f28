//! Resilience around upstream calls.
//!
//! [`ResilientCaller`] composes the pieces as
//! `fallback(retry(breaker(timeout(op))))`: every attempt is bounded by the
//! timeout, counted by the breaker, and retried per the policy; the
//! fallback sees only the final failure.

mod circuit_breaker;
mod fallback;
mod retry;
mod timeout;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState, StateChange,
};
pub use fallback::{Fallback, FallbackSource};
pub use retry::{RetryPolicy, RetryPredicate};
pub use timeout::with_timeout;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// Retry, circuit breaker and per-attempt timeout bundled for one upstream.
#[derive(Debug, Clone)]
pub struct ResilientCaller {
    name: String,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl ResilientCaller {
    /// Creates a caller with its own breaker.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        retry: RetryPolicy,
        breaker: CircuitBreakerConfig,
        timeout: Duration,
    ) -> Self {
        let name = name.into();
        Self {
            breaker: Arc::new(CircuitBreaker::new(name.clone(), breaker)),
            name,
            retry,
            timeout,
        }
    }

    /// Creates a caller sharing an existing breaker.
    #[must_use]
    pub fn with_breaker(
        name: impl Into<String>,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            retry,
            breaker,
            timeout,
        }
    }

    /// Caller name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker guarding this caller.
    #[must_use]
    pub const fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Per-attempt deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `operation` through timeout, breaker and retry.
    ///
    /// `operation` is invoked once per admitted attempt. Attempts rejected by
    /// an open breaker fail with `CircuitOpen`, which the default retry
    /// predicate does not retry.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn call<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = self.name.as_str();
        let breaker = &self.breaker;
        let limit = self.timeout;
        self.retry
            .run(move |attempt| {
                let admitted = breaker.admit().map(|()| {
                    debug!(caller = name, attempt, "calling upstream");
                    operation()
                });
                async move {
                    let outcome = with_timeout(name, limit, admitted?).await;
                    breaker.record(&outcome);
                    outcome
                }
            })
            .await
    }

    /// Like [`ResilientCaller::call`], with `fallback` consulted on failure.
    ///
    /// # Errors
    ///
    /// Returns the final error when the fallback does not apply to it.
    pub async fn call_with_fallback<T, F, Fut>(
        &self,
        operation: F,
        fallback: &Fallback<T>,
    ) -> Result<T>
    where
        T: Clone,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.call(operation).await {
            Ok(value) => Ok(value),
            Err(err) => fallback.apply(err),
        }
    }
}
