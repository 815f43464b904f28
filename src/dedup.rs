//! In-flight request deduplication.
//!
//! [`RequestDeduplicator::execute`] collapses concurrent calls that share a
//! key into one execution of the operation; every caller receives a clone
//! of the same outcome. The key is released as soon as the operation
//! settles, so this is not a cache.
//!
//! The operation runs as its own tokio task, supervised by a second task
//! that enforces the per-request timeout and releases the key even after
//! every caller has gone. On timeout every waiter gets a timeout error and
//! the operation is detached rather than aborted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default limit on distinct keys in flight.
pub const DEFAULT_MAX_PENDING: usize = 10;
/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default interval between stale-entry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// How long past its timeout an entry may linger before the sweep drops it.
pub const STALE_GRACE: Duration = Duration::from_secs(5);

/// Tuning for [`RequestDeduplicator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupOptions {
    /// Maximum distinct keys in flight.
    pub max_pending: usize,
    /// Timeout used when `execute` is given none.
    pub default_timeout: Duration,
    /// Interval of the stale sweep; `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            default_timeout: DEFAULT_TIMEOUT,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
        }
    }
}

/// Deduplication counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DedupStats {
    /// Calls that started an execution.
    pub unique_requests: u64,
    /// Calls that joined an execution already in flight.
    pub deduplicated_requests: u64,
    /// Keys currently in flight.
    pub pending: usize,
    /// `deduplicated / (unique + deduplicated)`, or 0 before any call.
    pub dedup_ratio: f64,
}

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T>>>;

struct PendingRequest<T> {
    generation: u64,
    outcome: SharedOutcome<T>,
    started_at: Instant,
    timeout: Duration,
    waiting_callers: usize,
}

struct DedupState<T> {
    pending: HashMap<String, PendingRequest<T>>,
    next_generation: u64,
    unique: u64,
    deduplicated: u64,
}

impl<T> DedupState<T> {
    /// Removes `key` only if it still belongs to `generation`.
    fn release(&mut self, key: &str, generation: u64) {
        if self
            .pending
            .get(key)
            .is_some_and(|p| p.generation == generation)
        {
            self.pending.remove(key);
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|key, p| {
            let keep = now.duration_since(p.started_at) <= p.timeout + STALE_GRACE;
            if !keep {
                warn!(key, waiting = p.waiting_callers, "releasing stale in-flight request");
            }
            keep
        });
        before - self.pending.len()
    }

    #[allow(clippy::cast_precision_loss)]
    fn ratio(&self) -> f64 {
        let total = self.unique + self.deduplicated;
        if total == 0 {
            0.0
        } else {
            self.deduplicated as f64 / total as f64
        }
    }
}

/// Decrements the waiting-caller count when a caller stops waiting.
struct Waiter<'a, T> {
    state: &'a Mutex<DedupState<T>>,
    key: &'a str,
    generation: u64,
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(p) = state.pending.get_mut(self.key)
            && p.generation == self.generation
        {
            p.waiting_callers = p.waiting_callers.saturating_sub(1);
        }
    }
}

/// Collapses concurrent identical calls into one execution.
pub struct RequestDeduplicator<T> {
    state: Arc<Mutex<DedupState<T>>>,
    options: DedupOptions,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<T> std::fmt::Debug for RequestDeduplicator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeduplicator")
            .field("options", &self.options)
            .field("pending", &self.state.lock().pending.len())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> RequestDeduplicator<T> {
    /// Creates a deduplicator and, when a tokio runtime is available,
    /// starts its stale sweep.
    #[must_use]
    pub fn new(options: DedupOptions) -> Self {
        let state = Arc::new(Mutex::new(DedupState {
            pending: HashMap::new(),
            next_generation: 0,
            unique: 0,
            deduplicated: 0,
        }));
        let sweeper = options
            .sweep_interval
            .and_then(|period| spawn_sweeper(Arc::downgrade(&state), period));
        Self {
            state,
            options,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Runs `operation` unless a call with the same `key` is already in
    /// flight, in which case its outcome is awaited instead.
    ///
    /// `operation` is only invoked by the caller that starts the execution,
    /// while the key table is locked, so it should do nothing but build the
    /// future. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] when `max_pending` distinct keys
    /// are in flight, [`Error::Timeout`] when the execution outlives its
    /// timeout, or whatever error the operation itself produced.
    pub async fn execute<F, Fut>(
        &self,
        key: &str,
        operation: F,
        timeout: Option<Duration>,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (outcome, generation) = {
            let mut state = self.state.lock();
            if let Some(pending) = state.pending.get_mut(key) {
                pending.waiting_callers += 1;
                let joined = (pending.outcome.clone(), pending.generation);
                let waiting = pending.waiting_callers;
                state.deduplicated += 1;
                debug!(key, waiting, dedup_ratio = state.ratio(), "joined in-flight request");
                joined
            } else {
                if state.pending.len() >= self.options.max_pending {
                    warn!(key, limit = self.options.max_pending, "too many requests in flight");
                    return Err(Error::ResourceExhausted {
                        limit: self.options.max_pending,
                    });
                }
                let generation = state.next_generation;
                state.next_generation += 1;
                state.unique += 1;

                let timeout = timeout.unwrap_or(self.options.default_timeout);
                let outcome = launch(
                    Arc::downgrade(&self.state),
                    key.to_owned(),
                    generation,
                    operation(),
                    timeout,
                );
                state.pending.insert(
                    key.to_owned(),
                    PendingRequest {
                        generation,
                        outcome: outcome.clone(),
                        started_at: Instant::now(),
                        timeout,
                        waiting_callers: 1,
                    },
                );
                debug!(key, timeout_ms = timeout.as_millis(), "started deduplicated request");
                (outcome, generation)
            }
        };

        let _waiter = Waiter {
            state: &self.state,
            key,
            generation,
        };
        outcome.await
    }

    /// Whether an execution for `key` is in flight.
    pub fn is_pending(&self, key: &str) -> bool {
        self.state.lock().pending.contains_key(key)
    }

    /// Callers currently awaiting `key`; 0 when nothing is in flight.
    pub fn waiting_callers(&self, key: &str) -> usize {
        self.state
            .lock()
            .pending
            .get(key)
            .map_or(0, |p| p.waiting_callers)
    }

    /// Current counters.
    pub fn stats(&self) -> DedupStats {
        let state = self.state.lock();
        DedupStats {
            unique_requests: state.unique,
            deduplicated_requests: state.deduplicated,
            pending: state.pending.len(),
            dedup_ratio: state.ratio(),
        }
    }

    /// Releases `key` so the next call starts a fresh execution.
    ///
    /// Callers already waiting still receive the original outcome.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.state.lock().pending.remove(key).is_some();
        if removed {
            debug!(key, "cancelled in-flight request");
        }
        removed
    }

    /// Releases every key, returning how many were in flight.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.pending.len();
        state.pending.clear();
        count
    }

    /// Drops entries older than their timeout plus [`STALE_GRACE`].
    pub fn sweep_stale(&self) -> usize {
        self.state.lock().sweep(Instant::now())
    }

    /// Stops the sweep and releases every key.
    pub fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let cancelled = self.cancel_all();
        debug!(cancelled, "deduplicator destroyed");
    }
}

impl<T> Drop for RequestDeduplicator<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

fn launch<T, Fut>(
    state: Weak<Mutex<DedupState<T>>>,
    key: String,
    generation: u64,
    operation: Fut,
    limit: Duration,
) -> SharedOutcome<T>
where
    T: Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    // Runs without any waiter polling it. Its release blocks on the table
    // lock until `execute` has inserted the entry.
    let supervisor = tokio::spawn(async move {
        let task = tokio::spawn(operation);
        let outcome = match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(Error::Internal {
                message: format!("deduplicated operation did not complete: {join_error}"),
            }),
            Err(_) => {
                warn!(key, timeout_ms = limit.as_millis(), "deduplicated request timed out");
                Err(Error::Timeout {
                    operation: key.clone(),
                    after: limit,
                })
            }
        };
        if let Some(state) = state.upgrade() {
            state.lock().release(&key, generation);
        }
        outcome
    });
    async move {
        supervisor.await.unwrap_or_else(|join_error| {
            Err(Error::Internal {
                message: format!("deduplicated request was lost: {join_error}"),
            })
        })
    }
    .boxed()
    .shared()
}

fn spawn_sweeper<T: Send + Sync + 'static>(
    state: Weak<Mutex<DedupState<T>>>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!("no tokio runtime; stale dedup entries are not swept");
        return None;
    };
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            let mut guard = state.lock();
            let released = guard.sweep(Instant::now());
            if released > 0 {
                debug!(released, dedup_ratio = guard.ratio(), "swept stale in-flight requests");
            }
        }
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;
    use crate::error::{ErrorKind, UpstreamError};

    fn dedup() -> Arc<RequestDeduplicator<String>> {
        Arc::new(RequestDeduplicator::new(DedupOptions {
            sweep_interval: None,
            ..DedupOptions::default()
        }))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_execution() {
        let dedup = dedup();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let dedup = Arc::clone(&dedup);
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                dedup
                    .execute(
                        "q",
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            gate.notified().await;
                            Ok("answer".to_string())
                        },
                        None,
                    )
                    .await
            }));
        }

        settle().await;
        assert!(dedup.is_pending("q"));
        assert_eq!(dedup.waiting_callers("q"), 5);

        gate.notify_one();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "answer");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!dedup.is_pending("q"));
        assert_eq!(dedup.waiting_callers("q"), 0);
        let stats = dedup.stats();
        assert_eq!(stats.unique_requests, 1);
        assert_eq!(stats.deduplicated_requests, 4);
        assert!((stats.dedup_ratio - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_receive_the_same_error() {
        let dedup = dedup();
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let dedup = Arc::clone(&dedup);
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                dedup
                    .execute(
                        "q",
                        move || async move {
                            gate.notified().await;
                            Err(UpstreamError::from_status(503, "unavailable").into())
                        },
                        None,
                    )
                    .await
            }));
        }
        settle().await;
        gate.notify_one();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Server);
        }
        assert!(!dedup.is_pending("q"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_key_runs_again() {
        let dedup = dedup();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let out = dedup
                .execute(
                    "q",
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok("x".to_string())
                    },
                    None,
                )
                .await
                .unwrap();
            assert_eq!(out, "x");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reaches_every_waiter_and_releases_key() {
        let dedup = dedup();
        let mut handles = Vec::new();
        for _ in 0..2 {
            let dedup = Arc::clone(&dedup);
            handles.push(tokio::spawn(async move {
                dedup
                    .execute(
                        "slow",
                        || async {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            Ok("late".to_string())
                        },
                        Some(Duration::from_secs(1)),
                    )
                    .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::Timeout { .. }));
        }
        assert!(!dedup.is_pending("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_pending_rejects_new_keys() {
        let dedup = Arc::new(RequestDeduplicator::<String>::new(DedupOptions {
            max_pending: 1,
            sweep_interval: None,
            ..DedupOptions::default()
        }));
        let gate = Arc::new(Notify::new());

        let first = {
            let dedup = Arc::clone(&dedup);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                dedup
                    .execute(
                        "a",
                        move || async move {
                            gate.notified().await;
                            Ok("a".to_string())
                        },
                        None,
                    )
                    .await
            })
        };
        settle().await;

        let err = dedup
            .execute("b", || async { Ok("b".to_string()) }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { limit: 1 }));

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_key_for_new_execution() {
        let dedup = dedup();
        let gate = Arc::new(Notify::new());
        let first = {
            let dedup = Arc::clone(&dedup);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                dedup
                    .execute(
                        "k",
                        move || async move {
                            gate.notified().await;
                            Ok("old".to_string())
                        },
                        None,
                    )
                    .await
            })
        };
        settle().await;

        assert!(dedup.cancel("k"));
        assert!(!dedup.is_pending("k"));
        let fresh = dedup
            .execute("k", || async { Ok("new".to_string()) }, None)
            .await
            .unwrap();
        assert_eq!(fresh, "new");

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), "old");
        assert_eq!(dedup.stats().unique_requests, 2);
    }

    fn abandoned(
        dedup: &Arc<RequestDeduplicator<String>>,
        key: &'static str,
    ) -> JoinHandle<Result<String>> {
        let dedup = Arc::clone(dedup);
        tokio::spawn(async move {
            dedup
                .execute(
                    key,
                    || std::future::pending::<Result<String>>(),
                    Some(Duration::from_secs(1)),
                )
                .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_key_after_every_waiter_left() {
        let dedup = dedup();
        let waiter = abandoned(&dedup, "stuck");
        settle().await;
        waiter.abort();
        settle().await;

        assert_eq!(dedup.waiting_callers("stuck"), 0);
        assert!(dedup.is_pending("stuck"));

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        settle().await;
        assert!(!dedup.is_pending("stuck"));
        assert_eq!(dedup.stats().pending, 0);

        let fresh = dedup
            .execute("stuck", || async { Ok("fresh".to_string()) }, None)
            .await
            .unwrap();
        assert_eq!(fresh, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_entries_past_grace() {
        let dedup = dedup();
        let waiter = abandoned(&dedup, "stuck");
        settle().await;

        let now = Instant::now();
        assert_eq!(dedup.state.lock().sweep(now + Duration::from_secs(6)), 0);
        assert_eq!(dedup.state.lock().sweep(now + Duration::from_secs(7)), 1);
        assert!(!dedup.is_pending("stuck"));
        waiter.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_everything() {
        let dedup = dedup();
        let gate = Arc::new(Notify::new());
        for key in ["a", "b"] {
            let dedup = Arc::clone(&dedup);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                dedup
                    .execute(
                        key,
                        move || async move {
                            gate.notified().await;
                            Ok(String::new())
                        },
                        None,
                    )
                    .await
            });
        }
        settle().await;
        assert_eq!(dedup.stats().pending, 2);
        dedup.destroy();
        assert_eq!(dedup.stats().pending, 0);
    }
}
