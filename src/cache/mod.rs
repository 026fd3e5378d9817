//! Response cache
//!
//! Key-normalized TTL cache with stale-while-revalidate and inflight
//! request coalescing. Entries past their TTL are still served (callers
//! prefer availability over strict freshness) while a single background
//! refresh runs; concurrent misses for one key share one upstream fetch.
//!
//! The cache map, inflight map, and revalidation set are owned here and
//! only reachable through the documented methods; locks are never held
//! across await points.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::metrics::Counter;

/// Errors surfaced by the miss path. Cache reads themselves never fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The wrapped fetcher failed; all waiters for the key receive this.
    #[error("upstream fetch failed: {0}")]
    Fetch(String),
    /// The inflight fetch was abandoned without settling.
    #[error("inflight fetch dropped")]
    Dropped,
}

/// Build the canonical cache key for a kind and parameter set.
///
/// Parameters are sorted by key so permutations of the same map collide:
/// `kind:k1=v1&k2=v2`.
pub fn generate_cache_key(kind: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(&str, &str)> = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{kind}:{joined}")
}

#[derive(Debug, Clone)]
struct Entry<T> {
    data: T,
    stored_at: Instant,
    last_access: Instant,
}

struct Inner<T> {
    entries: HashMap<String, Entry<T>>,
    inflight: HashMap<String, broadcast::Sender<Result<T, CacheError>>>,
    revalidating: HashSet<String>,
}

/// Counter snapshot for the metrics surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub inflight: usize,
    pub evictions: u64,
    pub coalesced_waiters: u64,
}

/// TTL cache with request coalescing and LRU capacity eviction.
pub struct CacheService<T> {
    inner: Mutex<Inner<T>>,
    ttl: Duration,
    max_entries: usize,
    hits: Counter,
    misses: Counter,
    evictions: Counter,
    coalesced: Counter,
}

enum Action<T> {
    Hit { data: T, refresh: bool },
    Join(broadcast::Receiver<Result<T, CacheError>>),
    Fetch(broadcast::Sender<Result<T, CacheError>>),
}

impl<T> CacheService<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                inflight: HashMap::new(),
                revalidating: HashSet::new(),
            }),
            ttl,
            max_entries: max_entries.max(1),
            hits: Counter::new(),
            misses: Counter::new(),
            evictions: Counter::new(),
            coalesced: Counter::new(),
        }
    }

    /// Fetch through the cache.
    ///
    /// Fresh or stale entries return immediately; a stale entry also
    /// triggers at most one background refresh which can never fail the
    /// caller. On a miss the fetcher runs once per key no matter how many
    /// callers arrive while it is inflight.
    pub async fn fetch_with_cache<F, Fut, E>(
        self: &Arc<Self>,
        kind: &str,
        params: &[(&str, &str)],
        fetcher: F,
    ) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display,
    {
        let key = generate_cache_key(kind, params);

        let action = {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.last_access = Instant::now();
                let data = entry.data.clone();
                let stale = entry.stored_at.elapsed() > self.ttl;
                let refresh = stale && !inner.revalidating.contains(&key);
                if refresh {
                    inner.revalidating.insert(key.clone());
                }
                Action::Hit { data, refresh }
            } else if let Some(tx) = inner.inflight.get(&key) {
                Action::Join(tx.subscribe())
            } else {
                let (tx, _rx) = broadcast::channel(1);
                inner.inflight.insert(key.clone(), tx.clone());
                Action::Fetch(tx)
            }
        };

        match action {
            Action::Hit { data, refresh } => {
                self.hits.inc();
                if refresh {
                    self.spawn_revalidation(key, fetcher);
                }
                Ok(data)
            }
            Action::Join(mut rx) => {
                self.misses.inc();
                self.coalesced.inc();
                match rx.recv().await {
                    Ok(result) => result,
                    Err(_) => Err(CacheError::Dropped),
                }
            }
            Action::Fetch(tx) => {
                self.misses.inc();
                let result = fetcher()
                    .await
                    .map_err(|e| CacheError::Fetch(e.to_string()));
                {
                    let mut inner = self.inner.lock();
                    inner.inflight.remove(&key);
                    if let Ok(data) = &result {
                        self.insert_locked(&mut inner, key, data.clone());
                    }
                }
                let _ = tx.send(result.clone());
                result
            }
        }
    }

    /// Launch the fire-and-forget stale refresh for `key`.
    fn spawn_revalidation<F, Fut, E>(self: &Arc<Self>, key: String, fetcher: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display,
    {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let result = fetcher().await;
            let mut inner = cache.inner.lock();
            inner.revalidating.remove(&key);
            match result {
                Ok(data) => {
                    cache.insert_locked(&mut inner, key, data);
                }
                Err(err) => {
                    // Stale entry stays; callers keep being served from it.
                    warn!(target: "cache", key = %key, error = %err, "background revalidation failed");
                }
            }
        });
    }

    fn insert_locked(&self, inner: &mut Inner<T>, key: String, data: T) {
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
                self.evictions.inc();
                debug!(target: "cache", key = %oldest, "evicted least-recently-used entry");
            }
        }
        let now = Instant::now();
        inner.entries.insert(
            key,
            Entry {
                data,
                stored_at: now,
                last_access: now,
            },
        );
    }

    /// Drop entries by exact key, by prefix, or everything when neither
    /// is given. Removed entries count as evictions.
    pub fn invalidate(&self, keys: Option<&[String]>, prefix: Option<&str>) {
        let mut inner = self.inner.lock();
        let mut removed = 0usize;
        match (keys, prefix) {
            (None, None) => {
                removed = inner.entries.len();
                inner.entries.clear();
            }
            _ => {
                if let Some(keys) = keys {
                    for key in keys {
                        if inner.entries.remove(key).is_some() {
                            removed += 1;
                        }
                    }
                }
                if let Some(prefix) = prefix {
                    let before = inner.entries.len();
                    inner.entries.retain(|k, _| !k.starts_with(prefix));
                    removed += before - inner.entries.len();
                }
            }
        }
        for _ in 0..removed {
            self.evictions.inc();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.get(),
            misses: self.misses.get(),
            entries: inner.entries.len(),
            inflight: inner.inflight.len(),
            evictions: self.evictions.get(),
            coalesced_waiters: self.coalesced.get(),
        }
    }

    /// Shift an entry's stored-at into the past (test hook for TTL paths).
    #[cfg(test)]
    pub(crate) fn backdate_entry(&self, key: &str, age: Duration) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            if let Some(past) = Instant::now().checked_sub(age) {
                entry.stored_at = past;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_cache(ttl: Duration, max: usize) -> Arc<CacheService<String>> {
        Arc::new(CacheService::new(ttl, max))
    }

    #[test]
    fn test_key_canonicalization_is_order_independent() {
        let a = generate_cache_key("topics", &[("trend", "7"), ("d", "2026-08-07")]);
        let b = generate_cache_key("topics", &[("d", "2026-08-07"), ("trend", "7")]);
        assert_eq!(a, b);
        assert_eq!(a, "topics:d=2026-08-07&trend=7");
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = make_cache(Duration::from_secs(60), 10);
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let first = cache
            .fetch_with_cache("trends", &[("d", "today")], move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("digest".to_string())
            })
            .await
            .unwrap();
        assert_eq!(first, "digest");

        let c = calls.clone();
        let second = cache
            .fetch_with_cache("trends", &[("d", "today")], move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("other".to_string())
            })
            .await
            .unwrap();
        assert_eq!(second, "digest");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let cache = make_cache(Duration::from_secs(60), 10);
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .fetch_with_cache("trends", &[("d", "today")], move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>("digest".to_string())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "digest");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_reaches_every_waiter() {
        let cache = make_cache(Duration::from_secs(60), 10);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .fetch_with_cache("trends", &[("d", "today")], || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err::<String, _>("boom".to_string())
                    })
                    .await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, CacheError::Fetch(msg) if msg.contains("boom")));
        }
        // a failed fetch leaves nothing behind
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.inflight, 0);
    }

    #[tokio::test]
    async fn test_stale_entry_served_and_refreshed_once() {
        let cache = make_cache(Duration::from_secs(1), 10);
        cache
            .fetch_with_cache("trends", &[("d", "today")], || async {
                Ok::<_, String>("old".to_string())
            })
            .await
            .unwrap();
        cache.backdate_entry("trends:d=today", Duration::from_secs(5));

        let refreshes = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let r = refreshes.clone();
            let value = cache
                .fetch_with_cache("trends", &[("d", "today")], move || async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Ok::<_, String>("new".to_string())
                })
                .await
                .unwrap();
            // stale data served immediately on every call
            assert_eq!(value, "old");
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);

        let value = cache
            .fetch_with_cache("trends", &[("d", "today")], || async {
                Ok::<_, String>("unused".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "new");
    }

    #[tokio::test]
    async fn test_failed_revalidation_keeps_stale_entry() {
        let cache = make_cache(Duration::from_secs(1), 10);
        cache
            .fetch_with_cache("trends", &[("d", "today")], || async {
                Ok::<_, String>("old".to_string())
            })
            .await
            .unwrap();
        cache.backdate_entry("trends:d=today", Duration::from_secs(5));

        let value = cache
            .fetch_with_cache("trends", &[("d", "today")], || async {
                Err::<String, _>("refresh down".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "old");

        tokio::time::sleep(Duration::from_millis(50)).await;
        // still served, refresh failure never surfaced
        let value = cache
            .fetch_with_cache("trends", &[("d", "today")], || async {
                Err::<String, _>("still down".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "old");
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let cache = make_cache(Duration::from_secs(60), 2);
        for key in ["a", "b"] {
            let value = key.to_string();
            cache
                .fetch_with_cache(key, &[], move || async move { Ok::<_, String>(value) })
                .await
                .unwrap();
        }
        // touch "a" so "b" becomes the eviction candidate
        cache
            .fetch_with_cache("a", &[], || async { Ok::<_, String>("x".to_string()) })
            .await
            .unwrap();
        cache
            .fetch_with_cache("c", &[], || async { Ok::<_, String>("c".to_string()) })
            .await
            .unwrap();

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 1);

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        cache
            .fetch_with_cache("b", &[], move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("b2".to_string())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "\"b\" should have been evicted");
    }

    #[tokio::test]
    async fn test_invalidate_by_prefix_and_clear() {
        let cache = make_cache(Duration::from_secs(60), 10);
        for (kind, id) in [("topics", "1"), ("topics", "2"), ("trends", "1")] {
            cache
                .fetch_with_cache(kind, &[("id", id)], || async {
                    Ok::<_, String>("v".to_string())
                })
                .await
                .unwrap();
        }
        cache.invalidate(None, Some("topics:"));
        assert_eq!(cache.stats().entries, 1);

        cache.invalidate(None, None);
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.evictions, 3);
    }

    #[tokio::test]
    async fn test_invalidate_exact_key() {
        let cache = make_cache(Duration::from_secs(60), 10);
        cache
            .fetch_with_cache("trends", &[("d", "today")], || async {
                Ok::<_, String>("v".to_string())
            })
            .await
            .unwrap();
        cache.invalidate(Some(&["trends:d=today".to_string()]), None);
        assert_eq!(cache.stats().entries, 0);
    }
}
