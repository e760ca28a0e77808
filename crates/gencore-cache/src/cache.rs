//! Bounded LRU-with-TTL response cache and single-flight coalescing.
//!
//! The cache owns two maps behind its own locks:
//!
//! - `entries`: fingerprint → cached response body with insertion and
//!   last-use timestamps. Lookups only return entries younger than the
//!   configured TTL; expired entries are removed lazily on access. At
//!   capacity the least-recently-used entry is evicted first, with the
//!   oldest insertion time as the tie-break.
//! - `inflight`: fingerprint → live producer handle. [`ResponseCache::do_or_wait`]
//!   guarantees at most one producer per fingerprint; concurrent duplicates
//!   subscribe to the producer's watch channel and receive its body (or its
//!   error) exactly once. If the producing task is cancelled before it
//!   publishes, one waiter promotes itself to producer and re-runs the
//!   request, so client churn never wedges the remaining waiters.
//!
//! Callers never touch the raw maps; every operation is atomic with respect
//! to the invariants above.

use crate::fingerprint::Fingerprint;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached bodies. Zero disables storage but keeps
    /// single-flight coalescing active.
    pub capacity: usize,
    /// Time-to-live for cached bodies.
    pub ttl: Duration,
    /// When false, behaves like `capacity = 0`.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl: Duration::from_secs(600),
            enabled: true,
        }
    }
}

/// Errors surfaced by [`ResponseCache::do_or_wait`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The producer for this fingerprint failed; every waiter observes the
    /// same message.
    #[error("producer failed: {0}")]
    Producer(String),
}

/// Read-only cache statistics for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests that skipped the backend by waiting on another request's
    /// in-flight producer.
    pub coalesced: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub in_flight: usize,
}

struct Entry {
    body: String,
    inserted_at: Instant,
    last_used: Instant,
}

#[derive(Clone)]
enum FlightState {
    Pending,
    Done(Result<String, String>),
    /// The producing task was dropped before publishing; waiters retry and
    /// one of them takes over.
    Abandoned,
}

struct Flight {
    tx: watch::Sender<FlightState>,
}

/// Fingerprint-keyed response cache with single-flight coalescing.
pub struct ResponseCache {
    config: CacheConfig,
    entries: Mutex<HashMap<Fingerprint, Entry>>,
    inflight: Mutex<HashMap<Fingerprint, Arc<Flight>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Look up a fresh entry. Expired entries are removed on access; a hit
    /// refreshes the entry's recency.
    pub fn get(&self, fp: &Fingerprint, now: Instant) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get_mut(fp) {
            Some(entry) if now.duration_since(entry.inserted_at) <= self.config.ttl => {
                entry.last_used = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.body.clone())
            }
            Some(_) => {
                entries.remove(fp);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert (or refresh) an entry, evicting the least-recently-used one
    /// when at capacity. With `capacity = 0` or a disabled cache this is a
    /// no-op.
    pub fn set(&self, fp: Fingerprint, body: String, now: Instant) {
        if !self.config.enabled || self.config.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&fp) {
            entry.body = body;
            entry.inserted_at = now;
            entry.last_used = now;
            return;
        }
        if entries.len() >= self.config.capacity {
            // LRU victim; ties broken by oldest insertion.
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, e)| (e.last_used, e.inserted_at))
                .map(|(k, _)| k.clone())
            {
                debug!(fingerprint = %victim, "evicting cache entry");
                entries.remove(&victim);
            }
        }
        entries.insert(
            fp,
            Entry {
                body,
                inserted_at: now,
                last_used: now,
            },
        );
    }

    /// The single-flight operation.
    ///
    /// Returns a fresh cached body when one exists. Otherwise, if another
    /// task is already producing this fingerprint, waits for its result.
    /// Otherwise installs itself as the producer, runs `producer`, stores a
    /// successful body, and publishes the outcome to every waiter.
    ///
    /// `producer` may be invoked again by a promoted waiter when the
    /// original producer is cancelled mid-flight, which is why it is `Fn`
    /// rather than `FnOnce`.
    pub async fn do_or_wait<F, Fut>(
        &self,
        fp: &Fingerprint,
        producer: F,
    ) -> Result<String, CacheError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<String, String>>,
    {
        loop {
            if let Some(body) = self.get(fp, Instant::now()) {
                return Ok(body);
            }

            enum Role {
                Producer(Arc<Flight>),
                Waiter(watch::Receiver<FlightState>),
            }

            let role = {
                let mut inflight = self.inflight.lock();
                match inflight.get(fp) {
                    Some(flight) => Role::Waiter(flight.tx.subscribe()),
                    None => {
                        let (tx, _rx) = watch::channel(FlightState::Pending);
                        let flight = Arc::new(Flight { tx });
                        inflight.insert(fp.clone(), flight.clone());
                        Role::Producer(flight)
                    }
                }
            };

            match role {
                Role::Producer(flight) => {
                    let mut guard = FlightGuard {
                        cache: self,
                        fp,
                        flight: flight.clone(),
                        armed: true,
                    };
                    let outcome = producer().await;
                    if let Ok(body) = &outcome {
                        self.set(fp.clone(), body.clone(), Instant::now());
                    }
                    // Remove the handle before publishing so late arrivals
                    // go through the cache (or start a fresh producer on
                    // error) instead of subscribing to a finished flight.
                    self.remove_flight(fp, &flight);
                    guard.armed = false;
                    let _ = flight.tx.send(FlightState::Done(outcome.clone()));
                    return outcome.map_err(CacheError::Producer);
                }
                Role::Waiter(mut rx) => {
                    let state = rx
                        .wait_for(|s| !matches!(s, FlightState::Pending))
                        .await
                        .map(|s| s.clone());
                    match state {
                        Ok(FlightState::Done(Ok(body))) => {
                            self.coalesced.fetch_add(1, Ordering::Relaxed);
                            return Ok(body);
                        }
                        Ok(FlightState::Done(Err(msg))) => {
                            self.coalesced.fetch_add(1, Ordering::Relaxed);
                            return Err(CacheError::Producer(msg));
                        }
                        // Producer dropped without publishing: retry, and
                        // possibly become the producer ourselves.
                        Ok(FlightState::Abandoned) | Err(_) => continue,
                        Ok(FlightState::Pending) => unreachable!("wait_for filtered Pending"),
                    }
                }
            }
        }
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            coalesced: self.coalesced.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            size: self.entries.lock().len(),
            capacity: self.config.capacity,
            ttl_secs: self.config.ttl.as_secs(),
            in_flight: self.inflight.lock().len(),
        }
    }

    fn remove_flight(&self, fp: &Fingerprint, flight: &Arc<Flight>) {
        let mut inflight = self.inflight.lock();
        if let Some(current) = inflight.get(fp) {
            if Arc::ptr_eq(current, flight) {
                inflight.remove(fp);
            }
        }
    }
}

/// Signals abandonment when a producer is dropped before publishing, so
/// waiters can promote instead of hanging.
struct FlightGuard<'a> {
    cache: &'a ResponseCache,
    fp: &'a Fingerprint,
    flight: Arc<Flight>,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.remove_flight(self.fp, &self.flight);
            let _ = self.flight.tx.send(FlightState::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{SamplingKey, completion_fingerprint};
    use std::sync::atomic::AtomicUsize;

    fn fp(label: &str) -> Fingerprint {
        completion_fingerprint("test-model", label, &SamplingKey::default(), false)
    }

    fn cache(capacity: usize, ttl: Duration) -> ResponseCache {
        ResponseCache::new(CacheConfig {
            capacity,
            ttl,
            enabled: true,
        })
    }

    #[test]
    fn test_get_miss_then_hit() {
        let c = cache(4, Duration::from_secs(60));
        let now = Instant::now();
        let k = fp("a");
        assert!(c.get(&k, now).is_none());
        c.set(k.clone(), "body".into(), now);
        assert_eq!(c.get(&k, now).as_deref(), Some("body"));
        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expired_entry_is_removed_on_access() {
        let c = cache(4, Duration::from_secs(10));
        let t0 = Instant::now();
        let k = fp("a");
        c.set(k.clone(), "body".into(), t0);

        let later = t0 + Duration::from_secs(11);
        assert!(c.get(&k, later).is_none());
        assert_eq!(c.stats().size, 0, "expired entry must be dropped");
    }

    #[test]
    fn test_entry_at_exact_ttl_is_still_fresh() {
        let c = cache(4, Duration::from_secs(10));
        let t0 = Instant::now();
        let k = fp("a");
        c.set(k.clone(), "body".into(), t0);
        assert!(c.get(&k, t0 + Duration::from_secs(10)).is_some());
    }

    #[test]
    fn test_capacity_bound_holds() {
        let c = cache(2, Duration::from_secs(60));
        let now = Instant::now();
        for i in 0..10 {
            c.set(fp(&format!("k{i}")), "b".into(), now + Duration::from_millis(i));
        }
        assert!(c.stats().size <= 2);
    }

    #[test]
    fn test_lru_eviction_prefers_least_recently_used() {
        let c = cache(2, Duration::from_secs(60));
        let t0 = Instant::now();
        let (a, b, d) = (fp("a"), fp("b"), fp("d"));
        c.set(a.clone(), "a".into(), t0);
        c.set(b.clone(), "b".into(), t0 + Duration::from_millis(1));
        // Touch `a` so `b` becomes the LRU victim.
        assert!(c.get(&a, t0 + Duration::from_millis(2)).is_some());
        c.set(d.clone(), "d".into(), t0 + Duration::from_millis(3));

        assert!(c.get(&a, t0 + Duration::from_millis(4)).is_some());
        assert!(c.get(&b, t0 + Duration::from_millis(4)).is_none());
        assert!(c.get(&d, t0 + Duration::from_millis(4)).is_some());
    }

    #[test]
    fn test_eviction_tie_break_is_oldest_insertion() {
        let c = cache(2, Duration::from_secs(60));
        let t0 = Instant::now();
        let (a, b, d) = (fp("a"), fp("b"), fp("d"));
        c.set(a.clone(), "a".into(), t0);
        c.set(b.clone(), "b".into(), t0 + Duration::from_millis(1));
        // Equalize recency; insertion times still differ.
        let t2 = t0 + Duration::from_millis(2);
        assert!(c.get(&a, t2).is_some());
        assert!(c.get(&b, t2).is_some());
        c.set(d.clone(), "d".into(), t0 + Duration::from_millis(3));

        assert!(c.get(&a, t2 + Duration::from_millis(1)).is_none(), "oldest insertion evicted");
        assert!(c.get(&b, t2 + Duration::from_millis(1)).is_some());
    }

    #[test]
    fn test_repeated_set_updates_in_place() {
        let c = cache(2, Duration::from_secs(60));
        let now = Instant::now();
        let k = fp("a");
        c.set(k.clone(), "v1".into(), now);
        c.set(k.clone(), "v2".into(), now + Duration::from_millis(1));
        assert_eq!(c.stats().size, 1);
        assert_eq!(c.get(&k, now + Duration::from_millis(2)).as_deref(), Some("v2"));
    }

    #[test]
    fn test_zero_capacity_never_stores() {
        let c = cache(0, Duration::from_secs(60));
        let now = Instant::now();
        let k = fp("a");
        c.set(k.clone(), "body".into(), now);
        assert!(c.get(&k, now).is_none());
        assert_eq!(c.stats().size, 0);
    }

    #[tokio::test]
    async fn test_do_or_wait_populates_cache() {
        let c = cache(4, Duration::from_secs(60));
        let k = fp("a");
        let body = c
            .do_or_wait(&k, || async { Ok::<_, String>("produced".to_string()) })
            .await
            .unwrap();
        assert_eq!(body, "produced");
        assert_eq!(c.get(&k, Instant::now()).as_deref(), Some("produced"));
    }

    #[tokio::test]
    async fn test_single_flight_runs_producer_once() {
        let c = Arc::new(cache(4, Duration::from_secs(60)));
        let k = fp("shared");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = c.clone();
            let k = k.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                c.do_or_wait(&k, || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, String>("shared-body".to_string())
                    }
                })
                .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "shared-body");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one producer call");
    }

    #[tokio::test]
    async fn test_producer_error_reaches_all_waiters() {
        let c = Arc::new(cache(4, Duration::from_secs(60)));
        let k = fp("err");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = c.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                c.do_or_wait(&k, || async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err::<String, _>("backend exploded".to_string())
                })
                .await
            }));
        }

        for h in handles {
            match h.await.unwrap() {
                Err(CacheError::Producer(msg)) => assert_eq!(msg, "backend exploded"),
                other => panic!("expected producer error, got {other:?}"),
            }
        }
        // Failure must not populate the cache or leak the in-flight handle.
        assert!(c.get(&k, Instant::now()).is_none());
        assert_eq!(c.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_cancelled_producer_promotes_a_waiter() {
        let c = Arc::new(cache(4, Duration::from_secs(60)));
        let k = fp("promote");

        let slow = {
            let c = c.clone();
            let k = k.clone();
            tokio::spawn(async move {
                c.do_or_wait(&k, || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, String>("slow".to_string())
                })
                .await
            })
        };
        // Let the slow task install itself as producer.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let c = c.clone();
            let k = k.clone();
            tokio::spawn(async move {
                c.do_or_wait(&k, || async { Ok::<_, String>("fast".to_string()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Client churn: the original producer goes away.
        slow.abort();

        let body = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("promoted waiter must finish")
            .unwrap()
            .unwrap();
        assert_eq!(body, "fast");
        assert_eq!(c.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_still_coalesces() {
        let c = Arc::new(cache(0, Duration::from_secs(60)));
        let k = fp("coalesce");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = c.clone();
            let k = k.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                c.do_or_wait(&k, || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, String>("x".to_string())
                    }
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Nothing cached: the next call produces again.
        c.do_or_wait(&k, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("y".to_string())
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_do_or_wait_hit_skips_producer() {
        let c = cache(4, Duration::from_secs(60));
        let k = fp("hit");
        c.set(k.clone(), "cached".into(), Instant::now());
        let calls = Arc::new(AtomicUsize::new(0));
        let body = c
            .do_or_wait(&k, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("produced".to_string())
                }
            })
            .await
            .unwrap();
        assert_eq!(body, "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "cached hit must skip the producer");
    }
}
