/// Request-coalescing TTL cache
///
/// One keyed cache for every read path (conversation lists, message pages,
/// media). A miss starts exactly one upstream fetch; concurrent callers for
/// the same key join it and all receive the same value or the same error.
/// Failures are never stored as entries.
use crate::error::{GatewayError, Result};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

/// Default upstream fetch bound
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

struct InFlight<V> {
    id: u64,
    result: SharedFetch<V>,
    joined: usize,
}

/// Clears the in-flight record it was armed for when dropped, unless a newer
/// fetch took the key over in the meantime
struct InFlightSlot<V> {
    state: Arc<Mutex<State<V>>>,
    key: String,
    id: u64,
}

impl<V> Drop for InFlightSlot<V> {
    fn drop(&mut self) {
        let mut state = lock(&*self.state);
        if state.inflight.get(&self.key).map(|f| f.id) == Some(self.id) {
            state.inflight.remove(&self.key);
            state.stats.failures += 1;
            warn!("fetch for {} ended without a result", self.key);
        }
    }
}

struct State<V> {
    entries: HashMap<String, CacheEntry<V>>,
    inflight: HashMap<String, InFlight<V>>,
    next_id: u64,
    stats: CacheStats,
}

/// Counters for cache behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Callers that attached to an outstanding fetch
    pub joins: u64,
    pub fetches: u64,
    pub failures: u64,
}

pub struct TtlCoalescer<V> {
    name: &'static str,
    state: Arc<Mutex<State<V>>>,
    fetch_timeout: Duration,
    max_entries: Option<usize>,
}

impl<V> Clone for TtlCoalescer<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            state: self.state.clone(),
            fetch_timeout: self.fetch_timeout,
            max_entries: self.max_entries,
        }
    }
}

fn lock<V>(state: &Mutex<State<V>>) -> MutexGuard<'_, State<V>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V> TtlCoalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an unbounded coalescer; `name` only labels log lines
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                inflight: HashMap::new(),
                next_id: 0,
                stats: CacheStats::default(),
            })),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_entries: None,
        }
    }

    pub fn with_fetch_timeout(mut self, limit: Duration) -> Self {
        self.fetch_timeout = limit;
        self
    }

    /// Bound the number of stored entries (oldest go first once expired ones are gone)
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max.max(1));
        self
    }

    /// Return the cached value for `key`, joining or starting a fetch on miss.
    ///
    /// `fetch` is invoked at most once per miss, outside the state lock, and
    /// its future runs on a spawned task so a caller that gives up waiting
    /// never cancels the fetch for the others.
    pub async fn get<F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let started = {
            let mut guard = lock(&*self.state);
            let state = &mut *guard;
            let now = Instant::now();

            match state.entries.get(key).map(|e| e.is_fresh(now)) {
                Some(true) => {
                    if let Some(entry) = state.entries.get(key) {
                        state.stats.hits += 1;
                        return Ok(entry.value.clone());
                    }
                }
                Some(false) => {
                    state.entries.remove(key);
                }
                None => {}
            }

            if let Some(inflight) = state.inflight.get_mut(key) {
                inflight.joined += 1;
                state.stats.joins += 1;
                debug!(
                    "[{}] joining in-flight fetch for {} ({} callers)",
                    self.name, key, inflight.joined
                );
                let pending = inflight.result.clone();
                drop(guard);
                Err(pending)
            } else {
                state.stats.misses += 1;
                state.stats.fetches += 1;
                let id = state.next_id;
                state.next_id += 1;

                let (done_tx, done_rx) = oneshot::channel::<Result<V>>();
                let owner = key.to_string();
                let shared: SharedFetch<V> = async move {
                    match done_rx.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(GatewayError::Internal(format!(
                            "fetch for {} did not complete",
                            owner
                        ))),
                    }
                }
                .boxed()
                .shared();
                state.inflight.insert(
                    key.to_string(),
                    InFlight {
                        id,
                        result: shared.clone(),
                        joined: 1,
                    },
                );
                Ok((id, shared, done_tx))
            }
        };
        let (id, pending, done_tx) = match started {
            Ok(started) => started,
            Err(pending) => return pending.await,
        };

        // Armed before `fetch` runs: a panic anywhere from here on still clears the slot
        let slot = InFlightSlot {
            state: self.state.clone(),
            key: key.to_string(),
            id,
        };
        let fut = fetch();
        self.spawn_fetch(slot, ttl, fut, done_tx);

        pending.await
    }

    fn spawn_fetch<Fut>(
        &self,
        slot: InFlightSlot<V>,
        ttl: Duration,
        fut: Fut,
        done_tx: oneshot::Sender<Result<V>>,
    ) where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let name = self.name;
        let limit = self.fetch_timeout;
        let max_entries = self.max_entries;

        tokio::spawn(async move {
            debug!("[{}] fetching {}", name, slot.key);
            let outcome = match timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(format!(
                    "fetch for {} exceeded {:?}",
                    slot.key, limit
                ))),
            };

            {
                let mut guard = lock(&*slot.state);
                let state = &mut *guard;
                // An eviction while we were fetching detaches us; our value may predate the write
                let current = state.inflight.get(&slot.key).map(|f| f.id) == Some(slot.id);
                if current {
                    state.inflight.remove(&slot.key);
                }

                match &outcome {
                    Ok(value) if current => {
                        state.entries.insert(
                            slot.key.clone(),
                            CacheEntry {
                                value: value.clone(),
                                stored_at: Instant::now(),
                                ttl,
                            },
                        );
                        if let Some(max) = max_entries {
                            enforce_capacity(&mut state.entries, max);
                        }
                    }
                    Ok(_) => debug!("[{}] not storing {}: evicted during fetch", name, slot.key),
                    Err(e) => {
                        state.stats.failures += 1;
                        warn!("[{}] fetch for {} failed: {}", name, slot.key, e);
                    }
                }
            }
            let _ = done_tx.send(outcome);
        });
    }

    /// Drop the entry for `key` and detach any in-flight fetch for it
    pub fn evict(&self, key: &str) -> bool {
        let mut state = lock(&*self.state);
        let had_entry = state.entries.remove(key).is_some();
        let had_inflight = state.inflight.remove(key).is_some();
        had_entry || had_inflight
    }

    /// Evict every key starting with `prefix`; returns how many keys were touched
    pub fn evict_prefix(&self, prefix: &str) -> usize {
        let mut guard = lock(&*self.state);
        let state = &mut *guard;
        let before = state.entries.len() + state.inflight.len();
        state.entries.retain(|k, _| !k.starts_with(prefix));
        state.inflight.retain(|k, _| !k.starts_with(prefix));
        let removed = before - (state.entries.len() + state.inflight.len());
        if removed > 0 {
            debug!("[{}] evicted {} keys under {}", self.name, removed, prefix);
        }
        removed
    }

    /// Drop expired entries
    pub fn purge_expired(&self) -> usize {
        let mut state = lock(&*self.state);
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.is_fresh(now));
        before - state.entries.len()
    }

    /// Number of stored entries (fresh or not yet purged)
    pub fn len(&self) -> usize {
        lock(&*self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetches currently outstanding
    pub fn in_flight(&self) -> usize {
        lock(&*self.state).inflight.len()
    }

    pub fn stats(&self) -> CacheStats {
        lock(&*self.state).stats
    }
}

fn enforce_capacity<V>(entries: &mut HashMap<String, CacheEntry<V>>, max: usize) {
    if entries.len() <= max {
        return;
    }
    let now = Instant::now();
    entries.retain(|_, e| e.is_fresh(now));
    while entries.len() > max {
        let oldest = entries
            .iter()
            .min_by_key(|(_, e)| e.stored_at)
            .map(|(k, _)| k.clone());
        match oldest {
            Some(k) => {
                entries.remove(&k);
            }
            None => break,
        }
    }
}
