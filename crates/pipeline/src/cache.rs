//! Bounded, deduplicating cache for content lookups.
//!
//! Entries expire after a TTL and the least recently used entry is evicted
//! once the cache is full. Concurrent lookups of a key that is being fetched
//! wait for that fetch instead of starting their own.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gitchron_types::{GitchronError, Result};
use parking_lot::{Condvar, Mutex};

type Outcome<V> = std::result::Result<Option<V>, String>;

/// Completion slot shared by a fetch and everyone waiting on it.
struct Flight<V> {
    outcome: Mutex<Option<Outcome<V>>>,
    done: Condvar,
}

impl<V: Clone> Flight<V> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    fn finish(&self, outcome: Outcome<V>) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.done.notify_all();
        }
    }

    fn wait(&self) -> Outcome<V> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut slot);
        }
    }
}

enum Slot<V> {
    Ready {
        value: V,
        inserted: Instant,
        last_used: u64,
    },
    Pending(Arc<Flight<V>>),
}

struct Inner<K, V> {
    slots: HashMap<K, Slot<V>>,
    tick: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub entries: usize,
}

pub struct ContentCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
}

/// What a lookup found for one key while holding the lock.
enum Claim<V> {
    Hit(V),
    Join(Arc<Flight<V>>),
    Fetch(Arc<Flight<V>>),
}

impl<K, V> ContentCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    /// Returns the cached value for `key`, or runs `fetch` to load it.
    /// Failed fetches are not cached.
    pub fn get_or_fetch<F>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let claim = {
            let mut inner = self.inner.lock();
            self.claim(&mut inner, &key)
        };

        match claim {
            Claim::Hit(value) => Ok(value),
            Claim::Join(flight) => match flight.wait() {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(GitchronError::NotFound("cached content".into())),
                Err(message) => Err(GitchronError::InvalidState(message)),
            },
            Claim::Fetch(flight) => {
                let mut guard = FlightGuard::new(self, vec![(key.clone(), flight.clone())]);
                self.fetches.fetch_add(1, Ordering::Relaxed);
                let result = fetch();
                guard.disarm();

                let mut inner = self.inner.lock();
                match result {
                    Ok(value) => {
                        self.settle(&mut inner, &key, &flight, Some(value.clone()));
                        flight.finish(Ok(Some(value.clone())));
                        Ok(value)
                    }
                    Err(e) => {
                        remove_pending(&mut inner, &key, &flight);
                        flight.finish(Err(e.to_string()));
                        Err(e)
                    }
                }
            }
        }
    }

    /// Batch form of [`ContentCache::get_or_fetch`]. Keys that are neither
    /// cached nor in flight are loaded with one call to `fetch`; keys the
    /// fetch does not return are absent from the result.
    pub fn get_or_fetch_many<F>(&self, keys: &[K], fetch: F) -> Result<HashMap<K, V>>
    where
        F: FnOnce(&[K]) -> Result<HashMap<K, V>>,
    {
        let mut found = HashMap::new();
        let mut joined = Vec::new();
        let mut claimed = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut seen = HashSet::new();
            for key in keys {
                if !seen.insert(key) {
                    continue;
                }
                match self.claim(&mut inner, key) {
                    Claim::Hit(value) => {
                        found.insert(key.clone(), value);
                    }
                    Claim::Join(flight) => joined.push((key.clone(), flight)),
                    Claim::Fetch(flight) => claimed.push((key.clone(), flight)),
                }
            }
        }

        if !claimed.is_empty() {
            let mut guard = FlightGuard::new(self, claimed.clone());
            let wanted: Vec<K> = claimed.iter().map(|(k, _)| k.clone()).collect();
            self.fetches.fetch_add(1, Ordering::Relaxed);
            let result = fetch(&wanted);
            guard.disarm();

            let mut inner = self.inner.lock();
            match result {
                Ok(mut loaded) => {
                    for (key, flight) in &claimed {
                        let value = loaded.remove(key);
                        match &value {
                            Some(v) => {
                                self.settle(&mut inner, key, flight, Some(v.clone()));
                                found.insert(key.clone(), v.clone());
                            }
                            None => remove_pending(&mut inner, key, flight),
                        }
                        flight.finish(Ok(value));
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    for (key, flight) in &claimed {
                        remove_pending(&mut inner, key, flight);
                        flight.finish(Err(message.clone()));
                    }
                    return Err(e);
                }
            }
        }

        for (key, flight) in joined {
            match flight.wait() {
                Ok(Some(value)) => {
                    found.insert(key, value);
                }
                Ok(None) => {}
                Err(message) => return Err(GitchronError::InvalidState(message)),
            }
        }
        Ok(found)
    }

    /// Drops every entry whose key matches. Fetches already in flight for
    /// those keys still answer their waiters but are not stored.
    pub fn invalidate_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&K) -> bool,
    {
        let mut inner = self.inner.lock();
        let before = inner.slots.len();
        inner.slots.retain(|k, _| !predicate(k));
        before - inner.slots.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn claim(&self, inner: &mut Inner<K, V>, key: &K) -> Claim<V> {
        inner.tick += 1;
        let tick = inner.tick;
        let ttl = self.ttl;

        match inner.slots.get_mut(key) {
            Some(Slot::Ready {
                value,
                inserted,
                last_used,
            }) if inserted.elapsed() < ttl => {
                *last_used = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Claim::Hit(value.clone());
            }
            Some(Slot::Pending(flight)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Claim::Join(flight.clone());
            }
            _ => {}
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let flight = Flight::new();
        inner.slots.insert(key.clone(), Slot::Pending(flight.clone()));
        Claim::Fetch(flight)
    }

    /// Replaces our pending slot with the fetched value, unless the key was
    /// invalidated meanwhile.
    fn settle(&self, inner: &mut Inner<K, V>, key: &K, flight: &Arc<Flight<V>>, value: Option<V>) {
        let ours = matches!(inner.slots.get(key), Some(Slot::Pending(f)) if Arc::ptr_eq(f, flight));
        if !ours {
            return;
        }
        match value {
            Some(value) => {
                inner.tick += 1;
                let tick = inner.tick;
                inner.slots.insert(
                    key.clone(),
                    Slot::Ready {
                        value,
                        inserted: Instant::now(),
                        last_used: tick,
                    },
                );
                self.evict(inner);
            }
            None => {
                inner.slots.remove(key);
            }
        }
    }

    fn evict(&self, inner: &mut Inner<K, V>) {
        let ttl = self.ttl;
        inner
            .slots
            .retain(|_, slot| {
                !matches!(slot, Slot::Ready { inserted, .. } if inserted.elapsed() >= ttl)
            });

        loop {
            let mut ready = 0;
            let mut oldest: Option<(u64, K)> = None;
            for (key, slot) in &inner.slots {
                if let Slot::Ready { last_used, .. } = slot {
                    ready += 1;
                    if oldest.as_ref().map_or(true, |(t, _)| last_used < t) {
                        oldest = Some((*last_used, key.clone()));
                    }
                }
            }
            match oldest {
                Some((_, key)) if ready > self.capacity => {
                    inner.slots.remove(&key);
                }
                _ => break,
            }
        }
    }
}

fn remove_pending<K: Eq + Hash, V>(inner: &mut Inner<K, V>, key: &K, flight: &Arc<Flight<V>>) {
    if matches!(inner.slots.get(key), Some(Slot::Pending(f)) if Arc::ptr_eq(f, flight)) {
        inner.slots.remove(key);
    }
}

/// Releases waiters with an error if the fetch unwinds.
struct FlightGuard<'a, K: Eq + Hash + Clone, V: Clone> {
    cache: &'a ContentCache<K, V>,
    flights: Vec<(K, Arc<Flight<V>>)>,
    armed: bool,
}

impl<'a, K: Eq + Hash + Clone, V: Clone> FlightGuard<'a, K, V> {
    fn new(cache: &'a ContentCache<K, V>, flights: Vec<(K, Arc<Flight<V>>)>) -> Self {
        Self {
            cache,
            flights,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Drop for FlightGuard<'_, K, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.cache.inner.lock();
        for (key, flight) in &self.flights {
            remove_pending(&mut inner, key, flight);
            flight.finish(Err("content fetch panicked".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    fn cache(capacity: usize) -> ContentCache<String, usize> {
        ContentCache::new(capacity, Duration::from_secs(60))
    }

    #[test]
    fn test_hit_after_fetch() {
        let cache = cache(4);
        let v = cache.get_or_fetch("a".into(), || Ok(1)).expect("fetch");
        assert_eq!(v, 1);
        let v = cache
            .get_or_fetch("a".into(), || panic!("must not refetch"))
            .expect("hit");
        assert_eq!(v, 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.fetches, stats.entries), (1, 1, 1, 1));
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = cache(4);
        let err = cache
            .get_or_fetch("a".into(), || Err(GitchronError::NotFound("a".into())))
            .unwrap_err();
        assert!(matches!(err, GitchronError::NotFound(_)));
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_fetch("a".into(), || Ok(2)).expect("retry"), 2);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache(2);
        cache.get_or_fetch("a".into(), || Ok(1)).expect("a");
        cache.get_or_fetch("b".into(), || Ok(2)).expect("b");
        // Touch a so b becomes least recently used.
        cache.get_or_fetch("a".into(), || Ok(0)).expect("a hit");
        cache.get_or_fetch("c".into(), || Ok(3)).expect("c");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_or_fetch("a".into(), || Ok(10)).expect("a"), 1);
        assert_eq!(cache.get_or_fetch("b".into(), || Ok(20)).expect("b refetched"), 20);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache: ContentCache<String, usize> = ContentCache::new(4, Duration::ZERO);
        cache.get_or_fetch("a".into(), || Ok(1)).expect("a");
        assert_eq!(cache.get_or_fetch("a".into(), || Ok(2)).expect("expired"), 2);
    }

    #[test]
    fn test_concurrent_callers_share_one_fetch() {
        let cache = Arc::new(cache(8));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_fetch("blob".into(), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(100));
                            Ok(42)
                        })
                        .expect("fetch")
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().expect("join"), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batch_fetches_only_missing_keys() {
        let cache = cache(8);
        cache.get_or_fetch("a".into(), || Ok(1)).expect("a");

        let keys: Vec<String> = vec!["a".into(), "b".into(), "c".into(), "b".into()];
        let mut requested = Vec::new();
        let found = cache
            .get_or_fetch_many(&keys, |missing| {
                requested = missing.to_vec();
                // "c" does not exist upstream.
                Ok(HashMap::from([("b".to_string(), 2)]))
            })
            .expect("batch");

        requested.sort();
        assert_eq!(requested, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], 1);
        assert_eq!(found["b"], 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_batch_joins_in_flight_fetch() {
        let cache = Arc::new(cache(8));
        let started = Arc::new(Barrier::new(2));
        let calls = Arc::new(AtomicUsize::new(0));

        let single = {
            let cache = cache.clone();
            let started = started.clone();
            let calls = calls.clone();
            std::thread::spawn(move || {
                cache
                    .get_or_fetch("k".into(), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        started.wait();
                        std::thread::sleep(Duration::from_millis(100));
                        Ok(7)
                    })
                    .expect("single")
            })
        };

        started.wait();
        let found = cache
            .get_or_fetch_many(&["k".to_string()], |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(HashMap::new())
            })
            .expect("batch");
        assert_eq!(found["k"], 7);
        assert_eq!(single.join().expect("join"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_fetch_releases_waiters() {
        let cache = Arc::new(cache(8));
        let started = Arc::new(Barrier::new(2));

        let leader = {
            let cache = cache.clone();
            let started = started.clone();
            std::thread::spawn(move || {
                let _ = cache.get_or_fetch("p".into(), || -> Result<usize> {
                    started.wait();
                    std::thread::sleep(Duration::from_millis(50));
                    panic!("boom");
                });
            })
        };

        started.wait();
        let err = cache.get_or_fetch("p".into(), || Ok(1));
        assert!(leader.join().is_err());
        // Either we joined the doomed flight or arrived after it was cleared.
        match err {
            Err(GitchronError::InvalidState(msg)) => assert!(msg.contains("panicked")),
            Ok(v) => assert_eq!(v, 1),
            Err(other) => panic!("unexpected error {other:?}"),
        }
        let fresh = cache.get_or_fetch("p".into(), || Ok(3)).expect("fresh");
        let hit = cache.get_or_fetch("p".into(), || Ok(4)).expect("hit");
        assert_eq!(fresh, hit);
    }

    #[test]
    fn test_invalidate_where() {
        let cache: ContentCache<(i64, String), usize> =
            ContentCache::new(8, Duration::from_secs(60));
        cache.get_or_fetch((1, "a".into()), || Ok(1)).expect("1a");
        cache.get_or_fetch((1, "b".into()), || Ok(2)).expect("1b");
        cache.get_or_fetch((2, "a".into()), || Ok(3)).expect("2a");

        assert_eq!(cache.invalidate_where(|(repo, _)| *repo == 1), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_or_fetch((1, "a".into()), || Ok(9)).expect("refetch"), 9);
    }
}
