//! Bounded lookup caches
//!
//! Fixed-capacity memo maps in front of the persistent lookup tables.
//! Overflow is handled per the configured eviction mode: plain LRU, or
//! dropping half the least-recently-used entries at once.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// How a full cache makes room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    /// Evict the least-recently-used entry per insert
    Lru,
    /// Evict half the least-recently-used entries on overflow
    ClearHalf,
}

/// Bounded memo map
pub struct LookupCache<Q: Hash + Eq, T: Clone> {
    inner: Mutex<LruCache<Q, T>>,
    mode: EvictionMode,
}

impl<Q: Hash + Eq, T: Clone> LookupCache<Q, T> {
    pub fn new(capacity: usize, mode: EvictionMode) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            mode,
        }
    }

    pub fn get(&self, key: &Q) -> Option<T> {
        self.inner.lock().get(key).cloned()
    }

    pub fn insert(&self, key: Q, value: T) {
        let mut inner = self.inner.lock();
        if self.mode == EvictionMode::ClearHalf && inner.len() == inner.cap().get() {
            let drop_count = inner.cap().get() / 2;
            for _ in 0..drop_count {
                inner.pop_lru();
            }
        }
        inner.put(key, value);
    }

    /// Get the memoized value, loading it on a miss. The lock is not held
    /// while the loader runs; concurrent misses may load twice, last one
    /// wins.
    pub fn get_or_try_insert(
        &self,
        key: Q,
        load: impl FnOnce() -> crate::Result<T>,
    ) -> crate::Result<T>
    where
        Q: Clone,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = load()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_eviction() {
        let cache: LookupCache<i64, i64> = LookupCache::new(3, EvictionMode::Lru);
        for i in 0..5 {
            cache.insert(i, i * 10);
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&0), None);
        assert_eq!(cache.get(&4), Some(40));
    }

    #[test]
    fn test_clear_half_eviction() {
        let cache: LookupCache<i64, i64> = LookupCache::new(4, EvictionMode::ClearHalf);
        for i in 0..4 {
            cache.insert(i, i);
        }
        assert_eq!(cache.len(), 4);

        // overflow drops the 2 least-recently-used entries, then inserts
        cache.insert(4, 4);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&0), None);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&3), Some(3));
        assert_eq!(cache.get(&4), Some(4));
    }

    #[test]
    fn test_get_or_try_insert_memoizes() {
        let cache: LookupCache<i64, i64> = LookupCache::new(4, EvictionMode::Lru);
        let mut loads = 0;
        for _ in 0..3 {
            let v = cache
                .get_or_try_insert(7, || {
                    loads += 1;
                    Ok(70)
                })
                .unwrap();
            assert_eq!(v, 70);
        }
        assert_eq!(loads, 1);
    }

    #[test]
    fn test_clear() {
        let cache: LookupCache<i64, i64> = LookupCache::new(4, EvictionMode::Lru);
        cache.insert(1, 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
