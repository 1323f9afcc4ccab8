//! Bounded memoization of per-mechanism accounting state.
//!
//! Calibration evaluates the same `(noise_multiplier, sampling_probability)`
//! pair many times across bisection steps and schedule regimes. Accountants
//! keep the expensive single-step representation (RDP curve or discretized
//! PLD) in a small least-recently-used cache keyed by the exact bit patterns
//! of both inputs, so cached results never differ from fresh ones.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use dpsgd_core::Result;
use parking_lot::Mutex;
use tracing::trace;

/// Default number of mechanisms kept per accountant.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Cache key: exact bit patterns of the mechanism parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MechanismKey {
    noise_multiplier: u64,
    sampling_probability: u64,
}

impl MechanismKey {
    /// Key for a subsampled Gaussian step.
    pub fn new(noise_multiplier: f64, sampling_probability: f64) -> Self {
        Self {
            noise_multiplier: noise_multiplier.to_bits(),
            sampling_probability: sampling_probability.to_bits(),
        }
    }
}

/// Hit and miss counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to build the entry.
    pub misses: u64,
    /// Entries dropped to respect the capacity.
    pub evictions: u64,
}

struct CacheInner<V> {
    entries: HashMap<MechanismKey, Arc<V>>,
    recency: VecDeque<MechanismKey>,
    stats: CacheStats,
}

impl<V> CacheInner<V> {
    fn touch(&mut self, key: MechanismKey) {
        if let Some(pos) = self.recency.iter().position(|k| *k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_back(key);
    }
}

/// Thread-safe LRU cache of per-mechanism results.
///
/// A capacity of zero disables caching. Cloning yields an empty cache with
/// the same capacity.
pub struct MechanismCache<V> {
    capacity: usize,
    inner: Mutex<CacheInner<V>>,
}

impl<V> MechanismCache<V> {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity),
                recency: VecDeque::with_capacity(capacity),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.stats = CacheStats::default();
    }

    /// Return the cached value for `key`, building it with `build` on a miss.
    ///
    /// The lock is not held while building, so concurrent misses on the same
    /// key may both build; the first insertion wins.
    pub fn get_or_try_insert_with<F>(&self, key: MechanismKey, build: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        {
            let mut inner = self.inner.lock();
            if let Some(hit) = inner.entries.get(&key).cloned() {
                inner.stats.hits += 1;
                inner.touch(key);
                return Ok(hit);
            }
            inner.stats.misses += 1;
        }

        let value = Arc::new(build()?);
        if self.capacity == 0 {
            return Ok(value);
        }

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get(&key).cloned() {
            inner.touch(key);
            return Ok(existing);
        }
        inner.entries.insert(key, Arc::clone(&value));
        inner.touch(key);
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.recency.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            inner.stats.evictions += 1;
            trace!(?oldest, "evicted cached mechanism");
        }
        Ok(value)
    }
}

impl<V> Default for MechanismCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl<V> Clone for MechanismCache<V> {
    fn clone(&self) -> Self {
        Self::new(self.capacity)
    }
}

impl<V> fmt::Debug for MechanismCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechanismCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpsgd_core::DpError;

    #[test]
    fn repeated_lookups_hit() {
        let cache = MechanismCache::new(4);
        let key = MechanismKey::new(1.0, 0.01);
        let a = cache.get_or_try_insert_with(key, || Ok(1u32)).expect("build");
        let b = cache
            .get_or_try_insert_with(key, || Ok(2u32))
            .expect("cached");
        assert_eq!(*a, 1);
        assert_eq!(*b, 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let cache = MechanismCache::new(3);
        for i in 0..10 {
            cache
                .get_or_try_insert_with(MechanismKey::new(i as f64, 0.5), || Ok(i))
                .expect("build");
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.stats().evictions, 7);
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let cache = MechanismCache::new(2);
        let k1 = MechanismKey::new(1.0, 0.1);
        let k2 = MechanismKey::new(2.0, 0.1);
        let k3 = MechanismKey::new(3.0, 0.1);
        cache.get_or_try_insert_with(k1, || Ok(1)).expect("k1");
        cache.get_or_try_insert_with(k2, || Ok(2)).expect("k2");
        cache.get_or_try_insert_with(k1, || Ok(10)).expect("k1 again");
        cache.get_or_try_insert_with(k3, || Ok(3)).expect("k3");
        let rebuilt = cache.get_or_try_insert_with(k2, || Ok(20)).expect("k2 again");
        assert_eq!(*rebuilt, 20);
        let kept = cache.get_or_try_insert_with(k3, || Ok(30)).expect("k3 again");
        assert_eq!(*kept, 3);
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = MechanismCache::new(0);
        let key = MechanismKey::new(1.0, 0.5);
        cache.get_or_try_insert_with(key, || Ok(1)).expect("build");
        let second = cache.get_or_try_insert_with(key, || Ok(2)).expect("rebuild");
        assert_eq!(*second, 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn build_errors_are_not_cached() {
        let cache: MechanismCache<u32> = MechanismCache::new(2);
        let key = MechanismKey::new(0.5, 0.5);
        assert!(cache
            .get_or_try_insert_with(key, || Err(DpError::numerical("boom")))
            .is_err());
        assert!(cache.is_empty());
        let ok = cache.get_or_try_insert_with(key, || Ok(7)).expect("build");
        assert_eq!(*ok, 7);
    }
}
