// Batch cache: TTL-bound supplier search batches with single-flight fetching.
// Entries are published as immutable Arcs, readers never block on a fetch
// unless the batch they want is missing or expired.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::model::{BatchKey, SearchSignature};
use crate::supplier::SupplierError;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    // How long an expired batch is kept around as a fallback
    pub stale_retention_seconds: u64,
    pub max_entries: usize,
    pub wait_timeout_ms: u64,
    pub cleanup_interval_seconds: u64,
    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 900,
            stale_retention_seconds: 3600,
            max_entries: 10_000,
            wait_timeout_ms: 15_000,
            cleanup_interval_seconds: 60,
            eviction_policy: EvictionPolicy::LeastRecentlyUsed,
        }
    }
}

// Which entry goes first once `max_entries` is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    LeastRecentlyUsed,
    LeastFrequentlyUsed,
    OldestFetch,
}

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Batch fetch failed: {0}")]
    Fetch(#[from] SupplierError),

    #[error("Timed out after {waited_ms}ms waiting for batch {key}")]
    Timeout { key: String, waited_ms: u64 },

    #[error("Batch fetch for {0} ended without a result")]
    FetchAborted(String),
}

impl CacheError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Fetch(e) => e.is_retryable(),
            CacheError::Timeout { .. } | CacheError::FetchAborted(_) => true,
        }
    }
}

#[derive(Debug)]
pub struct CacheEntry<T> {
    pub key: BatchKey,
    pub items: Vec<T>,
    pub fetched_at: DateTime<Utc>,
    pub ttl: TimeDelta,
    pub total_available: usize,
}

impl<T> CacheEntry<T> {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.fetched_at + self.ttl
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}

// What a fetch function hands back to the cache
#[derive(Debug, Clone)]
pub struct FetchedBatch<T> {
    pub items: Vec<T>,
    pub total_available: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSource {
    // Live entry, no supplier call
    Hit,
    // Fetched for this call or by a concurrent caller it waited on
    Fetched,
    // Refresh failed, expired entry served instead
    Stale,
}

#[derive(Debug)]
pub struct CacheLookup<T> {
    pub entry: Arc<CacheEntry<T>>,
    pub source: LookupSource,
}

impl<T> CacheLookup<T> {
    pub fn from_cache(&self) -> bool {
        self.source != LookupSource::Fetched
    }

    pub fn is_stale(&self) -> bool {
        self.source == LookupSource::Stale
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
    fetch_count: AtomicUsize,
    failed_fetch_count: AtomicUsize,
    coalesced_count: AtomicUsize,
    stale_served_count: AtomicUsize,
    timeout_count: AtomicUsize,
    eviction_count: AtomicUsize,
    expired_count: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStatsReport {
    pub items_count: usize,
    pub in_flight: usize,
    pub hit_count: usize,
    pub miss_count: usize,
    pub fetch_count: usize,
    pub failed_fetch_count: usize,
    pub coalesced_count: usize,
    pub stale_served_count: usize,
    pub timeout_count: usize,
    pub eviction_count: usize,
    pub expired_count: usize,
}

struct Slot<T> {
    entry: Arc<CacheEntry<T>>,
    access_count: AtomicU64,
    last_accessed_ms: AtomicI64,
}

impl<T> Slot<T> {
    fn new(entry: Arc<CacheEntry<T>>, now: DateTime<Utc>) -> Self {
        Self {
            entry,
            access_count: AtomicU64::new(0),
            last_accessed_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_accessed_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
    }
}

type FlightResult<T> = Result<Arc<CacheEntry<T>>, SupplierError>;
type Flight<T> = watch::Receiver<Option<FlightResult<T>>>;

pub struct BatchCache<T> {
    entries: DashMap<BatchKey, Slot<T>>,
    // Guards the "is anyone already fetching this key?" decision
    in_flight: Mutex<HashMap<BatchKey, Flight<T>>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    stats: CacheCounters,
}

// Removes the in-flight marker when the fetch task ends, including by panic
struct FlightGuard<T: Send + Sync + 'static> {
    cache: Arc<BatchCache<T>>,
    key: BatchKey,
}

impl<T: Send + Sync + 'static> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.cache.in_flight.lock().remove(&self.key);
    }
}

impl<T: Send + Sync + 'static> BatchCache<T> {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
            config,
            clock,
            stats: CacheCounters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn ttl(&self) -> TimeDelta {
        TimeDelta::seconds(self.config.ttl_seconds as i64)
    }

    fn stale_retention(&self) -> TimeDelta {
        TimeDelta::seconds(self.config.stale_retention_seconds as i64)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Live entry only, never triggers a fetch
    pub fn peek(&self, key: &BatchKey) -> Option<Arc<CacheEntry<T>>> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|slot| !slot.entry.is_expired(now))
            .map(|slot| Arc::clone(&slot.entry))
    }

    fn live_entry(&self, key: &BatchKey, now: DateTime<Utc>) -> Option<Arc<CacheEntry<T>>> {
        let slot = self.entries.get(key)?;
        if slot.entry.is_expired(now) {
            return None;
        }
        slot.touch(now);
        Some(Arc::clone(&slot.entry))
    }

    fn any_entry(&self, key: &BatchKey) -> Option<Arc<CacheEntry<T>>> {
        self.entries.get(key).map(|slot| Arc::clone(&slot.entry))
    }

    /// Returns the batch for `key`, fetching it with `fetch` when it is absent
    /// or expired. Concurrent callers for the same key share one fetch. A
    /// caller that gives up after `wait_timeout_ms` does not cancel the fetch.
    /// If the fetch fails or the wait times out and an expired entry exists,
    /// it is served as stale.
    pub async fn get_or_fetch<F, Fut>(
        self: &Arc<Self>,
        key: BatchKey,
        fetch: F,
    ) -> Result<CacheLookup<T>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<FetchedBatch<T>, SupplierError>> + Send + 'static,
    {
        if let Some(entry) = self.live_entry(&key, self.clock.now()) {
            self.stats.hit_count.fetch_add(1, Ordering::SeqCst);
            return Ok(CacheLookup {
                entry,
                source: LookupSource::Hit,
            });
        }

        let mut flight = {
            let mut in_flight = self.in_flight.lock();

            // A fetch may have published between the first look and the lock
            if let Some(entry) = self.live_entry(&key, self.clock.now()) {
                self.stats.hit_count.fetch_add(1, Ordering::SeqCst);
                return Ok(CacheLookup {
                    entry,
                    source: LookupSource::Hit,
                });
            }

            self.stats.miss_count.fetch_add(1, Ordering::SeqCst);
            match in_flight.get(&key) {
                Some(flight) => {
                    self.stats.coalesced_count.fetch_add(1, Ordering::SeqCst);
                    debug!(key = %key, "joining in-flight batch fetch");
                    flight.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(key.clone(), rx.clone());
                    self.spawn_fetch(key.clone(), tx, fetch);
                    rx
                }
            }
        };

        let wait = Duration::from_millis(self.config.wait_timeout_ms);
        let outcome = match tokio::time::timeout(wait, flight.wait_for(Option::is_some)).await {
            Err(_) => {
                self.stats.timeout_count.fetch_add(1, Ordering::SeqCst);
                warn!(key = %key, waited_ms = self.config.wait_timeout_ms, "gave up waiting for batch fetch");
                return self.stale_or(
                    &key,
                    CacheError::Timeout {
                        key: key.to_string(),
                        waited_ms: self.config.wait_timeout_ms,
                    },
                );
            }
            Ok(Err(_)) => None,
            Ok(Ok(result)) => result.clone(),
        };

        match outcome {
            Some(Ok(entry)) => Ok(CacheLookup {
                entry,
                source: LookupSource::Fetched,
            }),
            Some(Err(e)) => self.stale_or(&key, CacheError::Fetch(e)),
            None => self.stale_or(&key, CacheError::FetchAborted(key.to_string())),
        }
    }

    fn stale_or(&self, key: &BatchKey, error: CacheError) -> Result<CacheLookup<T>, CacheError> {
        match self.any_entry(key) {
            Some(entry) => {
                self.stats.stale_served_count.fetch_add(1, Ordering::SeqCst);
                warn!(
                    key = %key,
                    fetched_at = %entry.fetched_at,
                    error = %error,
                    "refresh failed, serving stale batch"
                );
                Ok(CacheLookup {
                    entry,
                    source: LookupSource::Stale,
                })
            }
            None => Err(error),
        }
    }

    fn spawn_fetch<F, Fut>(
        self: &Arc<Self>,
        key: BatchKey,
        tx: watch::Sender<Option<FlightResult<T>>>,
        fetch: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<FetchedBatch<T>, SupplierError>> + Send + 'static,
    {
        self.stats.fetch_count.fetch_add(1, Ordering::SeqCst);
        let guard = FlightGuard {
            cache: Arc::clone(self),
            key,
        };

        tokio::spawn(async move {
            let result = match fetch().await {
                Ok(batch) => Ok(guard.cache.publish(guard.key.clone(), batch)),
                Err(e) => {
                    guard
                        .cache
                        .stats
                        .failed_fetch_count
                        .fetch_add(1, Ordering::SeqCst);
                    warn!(key = %guard.key, error = %e, "batch fetch failed");
                    Err(e)
                }
            };
            // Waiters that already gave up are gone, nobody listening is fine
            let _ = tx.send(Some(result));
            drop(guard);
        });
    }

    // Store a batch, overwriting any stale entry for the key
    pub fn publish(&self, key: BatchKey, batch: FetchedBatch<T>) -> Arc<CacheEntry<T>> {
        let now = self.clock.now();
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            items: batch.items,
            fetched_at: now,
            ttl: self.ttl(),
            total_available: batch.total_available,
        });

        if !self.entries.contains_key(&key) {
            self.make_room(now);
        }
        self.entries
            .insert(key.clone(), Slot::new(Arc::clone(&entry), now));

        debug!(
            key = %key,
            items = entry.items.len(),
            total_available = entry.total_available,
            "batch cached"
        );
        entry
    }

    fn make_room(&self, now: DateTime<Utc>) {
        while self.entries.len() >= self.config.max_entries.max(1) {
            let victim = self.pick_victim(now);
            match victim {
                Some(key) => {
                    if self.entries.remove(&key).is_some() {
                        self.stats.eviction_count.fetch_add(1, Ordering::SeqCst);
                        debug!(key = %key, "evicted batch to stay under max_entries");
                    }
                }
                None => break,
            }
        }
    }

    fn pick_victim(&self, now: DateTime<Utc>) -> Option<BatchKey> {
        // Expired entries go before anything live
        let expired = self
            .entries
            .iter()
            .filter(|slot| slot.entry.is_expired(now))
            .min_by_key(|slot| slot.entry.fetched_at)
            .map(|slot| slot.key().clone());
        if expired.is_some() {
            return expired;
        }

        let iter = self.entries.iter();
        match self.config.eviction_policy {
            EvictionPolicy::LeastRecentlyUsed => iter
                .min_by_key(|slot| slot.last_accessed_ms.load(Ordering::Relaxed))
                .map(|slot| slot.key().clone()),
            EvictionPolicy::LeastFrequentlyUsed => iter
                .min_by_key(|slot| slot.access_count.load(Ordering::Relaxed))
                .map(|slot| slot.key().clone()),
            EvictionPolicy::OldestFetch => iter
                .min_by_key(|slot| slot.entry.fetched_at)
                .map(|slot| slot.key().clone()),
        }
    }

    // Drop entries that are past their TTL and past the stale retention window
    pub fn purge_expired(&self) -> usize {
        let cutoff = self.clock.now() - self.stale_retention();
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| slot.entry.expires_at() >= cutoff);
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            self.stats
                .expired_count
                .fetch_add(removed, Ordering::SeqCst);
            info!(removed, remaining = self.entries.len(), "purged expired batches");
        }
        removed
    }

    pub fn invalidate(&self, signature: &SearchSignature) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| &key.signature != signature);
        let removed = before.saturating_sub(self.entries.len());
        debug!(signature = %signature, removed, "invalidated batches");
        removed
    }

    pub fn invalidate_all(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    pub fn stats(&self) -> CacheStatsReport {
        CacheStatsReport {
            items_count: self.entries.len(),
            in_flight: self.in_flight.lock().len(),
            hit_count: self.stats.hit_count.load(Ordering::SeqCst),
            miss_count: self.stats.miss_count.load(Ordering::SeqCst),
            fetch_count: self.stats.fetch_count.load(Ordering::SeqCst),
            failed_fetch_count: self.stats.failed_fetch_count.load(Ordering::SeqCst),
            coalesced_count: self.stats.coalesced_count.load(Ordering::SeqCst),
            stale_served_count: self.stats.stale_served_count.load(Ordering::SeqCst),
            timeout_count: self.stats.timeout_count.load(Ordering::SeqCst),
            eviction_count: self.stats.eviction_count.load(Ordering::SeqCst),
            expired_count: self.stats.expired_count.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::model::Occupancy;
    use chrono::TimeZone;
    use test_case::test_case;

    fn signature(destination: &str) -> SearchSignature {
        SearchSignature::new(
            destination,
            "2025-06-11",
            "2025-06-14",
            Occupancy::adults(2),
            "USD",
        )
        .unwrap()
    }

    fn key(destination: &str, batch: u32) -> BatchKey {
        BatchKey::new(signature(destination), batch)
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn config() -> CacheConfig {
        CacheConfig {
            ttl_seconds: 300,
            stale_retention_seconds: 600,
            max_entries: 100,
            wait_timeout_ms: 2_000,
            cleanup_interval_seconds: 60,
            eviction_policy: EvictionPolicy::LeastRecentlyUsed,
        }
    }

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
        items: Vec<u32>,
    ) -> impl FnOnce() -> futures::future::Ready<Result<FetchedBatch<u32>, SupplierError>> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let total_available = items.len();
            futures::future::ready(Ok(FetchedBatch {
                items,
                total_available,
            }))
        }
    }

    fn failing_fetch() -> impl FnOnce() -> futures::future::Ready<Result<FetchedBatch<u32>, SupplierError>> {
        || futures::future::ready(Err(SupplierError::NetworkError("connection reset".to_string())))
    }

    #[tokio::test]
    async fn test_live_entry_is_served_without_fetch() {
        let cache = Arc::new(BatchCache::new(config(), clock()));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_fetch(key("dubai", 1), counting_fetch(&calls, vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(first.source, LookupSource::Fetched);
        assert!(!first.from_cache());

        let second = cache
            .get_or_fetch(key("dubai", 1), counting_fetch(&calls, vec![9]))
            .await
            .unwrap();
        assert_eq!(second.source, LookupSource::Hit);
        assert_eq!(second.entry.items, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first.entry, &second.entry));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_share_one_fetch() {
        let cache = Arc::new(BatchCache::<u32>::new(config(), Arc::new(SystemClock)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(key("dubai", 1), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(FetchedBatch {
                            items: vec![7; 100],
                            total_available: 100,
                        })
                    })
                    .await
            }));
        }

        let mut entries = Vec::new();
        for handle in handles {
            entries.push(handle.await.unwrap().unwrap().entry);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
        let stats = cache.stats();
        assert_eq!(stats.fetch_count, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let clock = clock();
        let cache = Arc::new(BatchCache::new(config(), clock.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_fetch(key("rome", 1), counting_fetch(&calls, vec![1]))
            .await
            .unwrap();
        clock.advance(TimeDelta::seconds(299));
        assert!(cache.peek(&key("rome", 1)).is_some());

        clock.advance(TimeDelta::seconds(2));
        assert!(cache.peek(&key("rome", 1)).is_none());

        let refreshed = cache
            .get_or_fetch(key("rome", 1), counting_fetch(&calls, vec![2]))
            .await
            .unwrap();
        assert_eq!(refreshed.source, LookupSource::Fetched);
        assert_eq!(refreshed.entry.items, vec![2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_stale_entry() {
        let clock = clock();
        let cache = Arc::new(BatchCache::new(config(), clock.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_fetch(key("paris", 1), counting_fetch(&calls, vec![1, 2]))
            .await
            .unwrap();
        clock.advance(TimeDelta::seconds(400));

        let lookup = cache
            .get_or_fetch(key("paris", 1), failing_fetch())
            .await
            .unwrap();
        assert!(lookup.is_stale());
        assert!(lookup.from_cache());
        assert_eq!(lookup.entry.items, vec![1, 2]);
        assert_eq!(cache.stats().stale_served_count, 1);
        assert_eq!(cache.stats().failed_fetch_count, 1);
    }

    #[tokio::test]
    async fn test_slow_refresh_serves_stale_entry_after_wait_timeout() {
        let clock = clock();
        let mut config = config();
        config.wait_timeout_ms = 30;
        let cache = Arc::new(BatchCache::new(config, clock.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_fetch(key("dubai", 1), counting_fetch(&calls, vec![1, 2, 3]))
            .await
            .unwrap();
        clock.advance(TimeDelta::seconds(400));

        let lookup = cache
            .get_or_fetch(key("dubai", 1), || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(FetchedBatch {
                    items: vec![4],
                    total_available: 1,
                })
            })
            .await
            .unwrap();
        assert!(lookup.is_stale());
        assert_eq!(lookup.entry.items, vec![1, 2, 3]);

        let stats = cache.stats();
        assert_eq!(stats.timeout_count, 1);
        assert_eq!(stats.stale_served_count, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_without_entry_is_an_error() {
        let cache = Arc::new(BatchCache::<u32>::new(config(), clock()));

        let err = cache
            .get_or_fetch(key("oslo", 1), failing_fetch())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Fetch(SupplierError::NetworkError(_))));
        assert!(err.is_retryable());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_timeout_does_not_cancel_fetch() {
        let mut config = config();
        config.wait_timeout_ms = 30;
        let cache = Arc::new(BatchCache::<u32>::new(config, Arc::new(SystemClock)));

        let err = cache
            .get_or_fetch(key("lisbon", 1), || async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(FetchedBatch {
                    items: vec![5],
                    total_available: 1,
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Timeout { .. }));
        assert!(err.is_retryable());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let lookup = cache
            .get_or_fetch(key("lisbon", 1), counting_fetch(&calls, vec![6]))
            .await
            .unwrap();
        assert_eq!(lookup.source, LookupSource::Hit);
        assert_eq!(lookup.entry.items, vec![5]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_fetch_releases_key() {
        let cache = Arc::new(BatchCache::<u32>::new(config(), clock()));

        let err = cache
            .get_or_fetch(key("madrid", 1), || async {
                if true {
                    panic!("supplier client bug");
                }
                Ok(FetchedBatch {
                    items: vec![],
                    total_available: 0,
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::FetchAborted(_)));

        let calls = Arc::new(AtomicUsize::new(0));
        let lookup = cache
            .get_or_fetch(key("madrid", 1), counting_fetch(&calls, vec![1]))
            .await
            .unwrap();
        assert_eq!(lookup.source, LookupSource::Fetched);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // Batch 1 is fetched first, batch 2 is read most often but not lately,
    // batch 3 is read once. Each policy picks a different victim.
    #[test_case(EvictionPolicy::LeastRecentlyUsed, 2; "lru")]
    #[test_case(EvictionPolicy::LeastFrequentlyUsed, 3; "lfu")]
    #[test_case(EvictionPolicy::OldestFetch, 1; "oldest fetch")]
    #[tokio::test]
    async fn test_max_entries_evicts_by_policy(policy: EvictionPolicy, victim: u32) {
        let clock = clock();
        let mut config = config();
        config.max_entries = 3;
        config.eviction_policy = policy;
        let cache = Arc::new(BatchCache::new(config, clock.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        for batch in 1..=3 {
            cache
                .get_or_fetch(key("berlin", batch), counting_fetch(&calls, vec![batch]))
                .await
                .unwrap();
            clock.advance(TimeDelta::seconds(1));
        }

        for (batch, reads) in [(2, 3), (3, 1), (1, 2)] {
            for _ in 0..reads {
                let lookup = cache
                    .get_or_fetch(key("berlin", batch), counting_fetch(&calls, vec![]))
                    .await
                    .unwrap();
                assert_eq!(lookup.source, LookupSource::Hit);
            }
            clock.advance(TimeDelta::seconds(1));
        }

        cache
            .get_or_fetch(key("berlin", 4), counting_fetch(&calls, vec![4]))
            .await
            .unwrap();

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().eviction_count, 1);
        for batch in 1..=4 {
            assert_eq!(cache.peek(&key("berlin", batch)).is_none(), batch == victim);
        }
    }

    #[tokio::test]
    async fn test_expired_entry_is_evicted_before_live_ones() {
        let clock = clock();
        let mut config = config();
        config.max_entries = 2;
        config.eviction_policy = EvictionPolicy::LeastFrequentlyUsed;
        let cache = Arc::new(BatchCache::new(config, clock.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            cache
                .get_or_fetch(key("athens", 1), counting_fetch(&calls, vec![1]))
                .await
                .unwrap();
        }
        clock.advance(TimeDelta::seconds(200));
        cache
            .get_or_fetch(key("athens", 2), counting_fetch(&calls, vec![2]))
            .await
            .unwrap();
        // Batch 1 is read more often but has expired
        clock.advance(TimeDelta::seconds(150));
        cache
            .get_or_fetch(key("athens", 3), counting_fetch(&calls, vec![3]))
            .await
            .unwrap();

        assert!(cache.peek(&key("athens", 2)).is_some());
        assert!(cache.peek(&key("athens", 3)).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_only_touches_one_signature() {
        let cache = Arc::new(BatchCache::new(config(), clock()));
        let calls = Arc::new(AtomicUsize::new(0));

        for (destination, batch) in [("dubai", 1), ("dubai", 2), ("doha", 1)] {
            cache
                .get_or_fetch(key(destination, batch), counting_fetch(&calls, vec![batch]))
                .await
                .unwrap();
        }

        assert_eq!(cache.invalidate(&signature("dubai")), 2);
        assert!(cache.peek(&key("doha", 1)).is_some());
        assert_eq!(cache.invalidate_all(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_purge_keeps_entries_within_stale_retention() {
        let clock = clock();
        let cache = Arc::new(BatchCache::new(config(), clock.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_fetch(key("vienna", 1), counting_fetch(&calls, vec![1]))
            .await
            .unwrap();

        // ttl 300s + retention 600s
        clock.advance(TimeDelta::seconds(800));
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 1);

        clock.advance(TimeDelta::seconds(200));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expired_count, 1);
    }
}
