//! Bounded in-memory cache with per-entry expiry.
//!
//! Entries expire `ttl` after insertion and are dropped lazily on access and
//! by a background sweep. At capacity the oldest entry by insertion time is
//! evicted; reads do not refresh an entry's position.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// Default entry limit.
pub const DEFAULT_MAX_SIZE: usize = 100;
/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Tuning for [`TtlCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// Lifetime used when `set` is called without one.
    pub default_ttl: Duration,
    /// Maximum number of entries. Zero disables storage.
    pub max_size: usize,
    /// Interval of the background sweep; `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            max_size: DEFAULT_MAX_SIZE,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
        }
    }
}

/// A stored value with its timing metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    /// The cached value.
    pub value: T,
    /// When the entry was inserted.
    pub timestamp: Instant,
    /// Lifetime granted at insertion.
    pub ttl: Duration,
    /// `timestamp + ttl`.
    pub expires_at: Instant,
    seq: u64,
}

impl<T> CacheEntry<T> {
    /// An entry is expired strictly after `expires_at`.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Hit/miss counters and occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads that returned a value.
    pub hits: u64,
    /// Reads that found nothing or an expired entry.
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Entries currently stored, including expired ones not yet swept.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// `hits / (hits + misses)`, or 0 before any read.
    pub hit_ratio: f64,
}

struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<T> CacheState<T> {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before - self.entries.len()
    }
}

/// TTL cache keyed by string.
pub struct TtlCache<T> {
    state: Arc<Mutex<CacheState<T>>>,
    options: CacheOptions,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<T> std::fmt::Debug for TtlCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("options", &self.options)
            .field("len", &self.state.lock().entries.len())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> TtlCache<T> {
    /// Creates a cache and, when a tokio runtime is available, starts its
    /// background sweep.
    #[must_use]
    pub fn new(options: CacheOptions) -> Self {
        let state = Arc::new(Mutex::new(CacheState {
            entries: HashMap::new(),
            next_seq: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
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

    /// Returns the value for `key` if present and not expired.
    ///
    /// An expired entry is removed and counted as a miss.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let lookup = state
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired_at(now)).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => {
                state.hits += 1;
                trace!(key, "cache hit");
                Some(value)
            }
            Some(None) => {
                state.entries.remove(key);
                state.misses += 1;
                debug!(key, "cache entry expired");
                None
            }
            None => {
                state.misses += 1;
                trace!(key, "cache miss");
                None
            }
        }
    }

    /// Stores `value` under `key`, replacing any previous entry.
    ///
    /// `ttl` defaults to [`CacheOptions::default_ttl`]. Inserting a new key
    /// into a full cache evicts the oldest entry first.
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Option<Duration>) {
        if self.options.max_size == 0 {
            return;
        }
        let key = key.into();
        let ttl = ttl.unwrap_or(self.options.default_ttl);
        let now = Instant::now();
        let mut state = self.state.lock();

        if !state.entries.contains_key(&key) && state.entries.len() >= self.options.max_size {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.timestamp, entry.seq))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                state.entries.remove(&oldest);
                state.evictions += 1;
                debug!(evicted = %oldest, "cache full; evicted oldest entry");
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key,
            CacheEntry {
                value,
                timestamp: now,
                ttl,
                expires_at: now + ttl,
                seq,
            },
        );
    }

    /// Whether a live entry exists for `key`. Does not touch the counters.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Removes every entry and resets the counters.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.hits = 0;
        state.misses = 0;
        state.evictions = 0;
    }

    /// Number of stored entries, including expired ones not yet removed.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry now, returning how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        self.state.lock().sweep(Instant::now())
    }

    /// Current counters.
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let reads = state.hits + state.misses;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            size: state.entries.len(),
            max_size: self.options.max_size,
            hit_ratio: if reads == 0 {
                0.0
            } else {
                state.hits as f64 / reads as f64
            },
        }
    }

    /// Stops the background sweep and drops every entry.
    pub fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.clear();
        debug!("cache destroyed");
    }
}

impl<T> Drop for TtlCache<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

fn spawn_sweeper<T: Send + 'static>(
    state: Weak<Mutex<CacheState<T>>>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!("no tokio runtime; cache expiry is lazy only");
        return None;
    };
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            let removed = state.lock().sweep(Instant::now());
            if removed > 0 {
                debug!(removed, "swept expired cache entries");
            }
        }
    }))
}
