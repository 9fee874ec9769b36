use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::clock::{Clock, SystemClock};

/// Sizing and housekeeping for a [`CoalescingCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum number of stored entries (at least 1).
    pub max_entries: usize,
    /// Period of the background expiry sweep.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            sweep_interval_secs: 300,
        }
    }
}

impl CacheConfig {
    /// The sweep period as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Errors returned by [`CoalescingCache::resolve`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The fetcher failed. Every caller that was waiting on the same fetch
    /// receives a clone of the same `cause`.
    #[error("Fetch for '{key}' failed: {cause:#}")]
    FetchFailed {
        /// The key being resolved.
        key: String,
        /// The fetcher's error, shared by all awaiters.
        cause: Arc<anyhow::Error>,
    },
}

impl CacheError {
    /// The fetcher's error.
    pub fn cause(&self) -> &anyhow::Error {
        match self {
            CacheError::FetchFailed { cause, .. } => cause,
        }
    }
}

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Stored entries (expired ones included until touched or swept).
    pub size: usize,
    /// Capacity.
    pub max_size: usize,
    /// Fetches currently in flight.
    pub in_flight: usize,
    /// Valid hits served by `get`/`resolve`.
    pub hits: u64,
    /// Misses, including lazily expired entries.
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

struct Entry<V> {
    value: V,
    created_at: i64,
    expires_at: i64,
    /// Key into `State::lru`.
    touched: u64,
}

struct State<V> {
    entries: HashMap<String, Entry<V>>,
    /// touch counter → key; the first entry is the least recently touched.
    lru: BTreeMap<u64, String>,
    in_flight: HashMap<String, SharedFetch<V>>,
    counter: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

struct CacheInner<V> {
    max_entries: usize,
    clock: Arc<dyn Clock>,
    state: Mutex<State<V>>,
}

/// TTL cache with LRU bounding and in-flight request coalescing.
///
/// Cloning is cheap and clones share storage. Values are cloned out on every
/// hit, so large payloads should be wrapped in an `Arc`.
pub struct CoalescingCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for CoalescingCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for CoalescingCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingCache")
            .field("max_entries", &self.inner.max_entries)
            .finish_non_exhaustive()
    }
}

impl<V> CoalescingCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache on the system clock.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates an empty cache on a custom clock.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                max_entries: config.max_entries.max(1),
                clock,
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    lru: BTreeMap::new(),
                    in_flight: HashMap::new(),
                    counter: 0,
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                }),
            }),
        }
    }

    /// Returns the value if it has not expired. An expired entry is removed.
    /// A hit makes the key most recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.inner.clock.now_ms();
        self.inner.lock().lookup(key, now)
    }

    /// Stores `value` for `ttl_secs` seconds, evicting the least recently
    /// used key first when full and `key` is new.
    pub fn set(&self, key: &str, value: V, ttl_secs: u64) {
        let now = self.inner.clock.now_ms();
        self.inner
            .lock()
            .insert(key, value, ttl_secs, now, self.inner.max_entries);
    }

    /// Removes `key`. Returns whether it was stored.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key)
    }

    /// Removes every entry. In-flight fetches are not affected.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.entries.clear();
        state.lru.clear();
    }

    /// Returns the cached value, or joins the fetch already in flight for
    /// `key`, or runs `fetcher` once and caches its value for `ttl_secs`.
    ///
    /// Concurrent callers for the same key share one `fetcher` invocation and
    /// observe the same result. Errors are returned to every waiter and
    /// nothing is cached, so the next call fetches again. There is no
    /// timeout; wrap the fetcher to add one. Dropping the returned future
    /// does not cancel the fetch: it still completes and fills the cache.
    ///
    /// # Panics
    ///
    /// Starting a fetch spawns a task, so a miss must be resolved from within
    /// a Tokio runtime.
    pub async fn resolve<F, Fut, E>(&self, key: &str, fetcher: F, ttl_secs: u64) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let fetch = {
            let now = self.inner.clock.now_ms();
            let mut state = self.inner.lock();
            if let Some(value) = state.lookup(key, now) {
                return Ok(value);
            }
            match state.in_flight.get(key) {
                Some(pending) => {
                    log::debug!("Joining in-flight fetch for '{}'", key);
                    pending.clone()
                }
                None => {
                    // Registered before the lock is released, so the fetch
                    // task cannot settle ahead of its own marker.
                    let fetch = self.start_fetch(key, fetcher, ttl_secs);
                    state.in_flight.insert(key.to_string(), fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    /// Wraps the fetcher with settlement and drives it on a spawned task, so
    /// the result is stored and the marker cleared even if every awaiter
    /// goes away first.
    fn start_fetch<F, Fut, E>(&self, key: &str, fetcher: F, ttl_secs: u64) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let weak: Weak<CacheInner<V>> = Arc::downgrade(&self.inner);
        let key = key.to_string();
        let fetch = async move {
            log::debug!("Fetching '{}'", key);
            let result = fetcher().await.map_err(|e| CacheError::FetchFailed {
                key: key.clone(),
                cause: Arc::new(e.into()),
            });
            if let Some(inner) = weak.upgrade() {
                inner.settle(&key, &result, ttl_secs);
            }
            result
        }
        .boxed()
        .shared();
        tokio::spawn(fetch.clone().map(drop));
        fetch
    }

    /// Removes every entry whose deadline has passed. Returns how many.
    pub fn sweep_expired(&self) -> usize {
        let now = self.inner.clock.now_ms();
        let mut state = self.inner.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        if !expired.is_empty() {
            log::debug!("Swept {} expired cache entries", expired.len());
        }
        expired.len()
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `period` until
    /// `cancel` fires or the cache is dropped.
    pub fn spawn_sweeper(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        // interval_at rejects a zero period
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        CoalescingCache { inner }.sweep_expired();
                    }
                }
            }
            log::debug!("Cache sweeper stopped");
        })
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.lock();
        CacheStats {
            size: state.entries.len(),
            max_size: self.inner.max_entries,
            in_flight: state.in_flight.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    /// Stored entries, expired ones included until touched or swept.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// No stored entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` holds an unexpired value. Does not touch the LRU order.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.inner.clock.now_ms();
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| now < entry.expires_at)
    }
}

impl<V: Clone> CacheInner<V> {
    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, key: &str, result: &Result<V, CacheError>, ttl_secs: u64) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.in_flight.remove(key);
        match result {
            Ok(value) => state.insert(key, value.clone(), ttl_secs, now, self.max_entries),
            Err(e) => log::warn!("{}", e),
        }
    }
}

impl<V: Clone> State<V> {
    fn lookup(&mut self, key: &str, now: i64) -> Option<V> {
        let Some(entry) = self.entries.get(key) else {
            self.misses += 1;
            return None;
        };
        if now >= entry.expires_at {
            let age_ms = now - entry.created_at;
            self.remove(key);
            self.misses += 1;
            log::debug!("'{}' expired after {} ms", key, age_ms);
            return None;
        }
        let value = entry.value.clone();
        self.touch(key);
        self.hits += 1;
        Some(value)
    }

    fn insert(&mut self, key: &str, value: V, ttl_secs: u64, now: i64, max_entries: usize) {
        if !self.entries.contains_key(key) && self.entries.len() >= max_entries {
            self.evict_lru();
        }
        let ttl_ms = i64::try_from(ttl_secs.saturating_mul(1_000)).unwrap_or(i64::MAX);
        let previous = self.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                expires_at: now.saturating_add(ttl_ms),
                touched: 0,
            },
        );
        if let Some(previous) = previous {
            self.lru.remove(&previous.touched);
        }
        self.touch(key);
    }

    fn touch(&mut self, key: &str) {
        self.counter += 1;
        let counter = self.counter;
        if let Some(entry) = self.entries.get_mut(key) {
            self.lru.remove(&entry.touched);
            entry.touched = counter;
            self.lru.insert(counter, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.lru.remove(&entry.touched);
                true
            }
            None => false,
        }
    }

    fn evict_lru(&mut self) {
        if let Some((_, key)) = self.lru.pop_first() {
            self.entries.remove(&key);
            self.evictions += 1;
            log::debug!("Evicted least recently used key '{}'", key);
        }
    }
}
