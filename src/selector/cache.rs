//! Bounded LRU cache for search results.
//!
//! Entries belong to one catalog generation. The first access with a newer
//! generation drops everything; inserts computed against an older generation
//! are discarded so a slow search cannot repopulate the cache with results
//! from a catalog that has since been replaced.
//!
//! Keys are spread over a fixed set of shards so concurrent lookups of
//! different queries do not contend. Every entry carries a stamp from one
//! shared clock, and eviction removes the entry with the oldest stamp across
//! all shards, so the cache as a whole stays strictly LRU.

use lru::LruCache;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const SHARDS: usize = 8;

/// Normalized query plus filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub query: String,
    pub k: usize,
    pub platform: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct Stamped<V> {
    stamp: u64,
    value: V,
}

struct Shard<V> {
    generation: u64,
    lru: LruCache<CacheKey, Stamped<V>>,
}

impl<V> Shard<V> {
    fn align(&mut self, generation: u64) {
        if generation > self.generation {
            self.lru.clear();
            self.generation = generation;
        }
    }

    fn oldest_stamp(&self) -> Option<u64> {
        self.lru.peek_lru().map(|(_, entry)| entry.stamp)
    }
}

pub struct QueryCache<V> {
    shards: Vec<Mutex<Shard<V>>>,
    /// Newest generation any caller has presented.
    generation: AtomicU64,
    clock: AtomicU64,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> std::fmt::Debug for QueryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("max_size", &self.max_size)
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

impl<V: Clone> QueryCache<V> {
    pub fn new(max_size: usize) -> Self {
        let shards = (0..SHARDS)
            .map(|_| {
                Mutex::new(Shard {
                    generation: 0,
                    lru: LruCache::unbounded(),
                })
            })
            .collect();
        Self {
            shards,
            generation: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard_of(key: &CacheKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % SHARDS as u64) as usize
    }

    /// Lock a shard, dropping its entries if they predate the newest generation.
    fn lock(&self, index: usize) -> MutexGuard<'_, Shard<V>> {
        let mut shard = self.shards[index]
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        shard.align(self.generation.load(Ordering::Acquire));
        shard
    }

    /// Returns false when `generation` is older than one already seen.
    fn observe(&self, generation: u64) -> bool {
        let newest = self.generation.fetch_max(generation, Ordering::AcqRel);
        generation >= newest
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up and promote `key`. Counts a hit or a miss.
    pub fn get(&self, generation: u64, key: &CacheKey) -> Option<V> {
        let found = if self.observe(generation) {
            let stamp = self.tick();
            let mut shard = self.lock(Self::shard_of(key));
            shard.lru.get_mut(key).map(|entry| {
                entry.stamp = stamp;
                entry.value.clone()
            })
        } else {
            None
        };
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Insert, evicting the least recently used entry when full.
    pub fn put(&self, generation: u64, key: CacheKey, value: V) {
        if !self.observe(generation) {
            return;
        }
        {
            let stamp = self.tick();
            let mut shard = self.lock(Self::shard_of(&key));
            if shard.generation != generation {
                return;
            }
            shard.lru.put(key, Stamped { stamp, value });
        }
        while self.len() > self.max_size {
            if !self.evict_oldest() {
                break;
            }
        }
    }

    /// Pop the entry with the oldest stamp across all shards.
    fn evict_oldest(&self) -> bool {
        let oldest = (0..self.shards.len())
            .filter_map(|index| self.lock(index).oldest_stamp().map(|stamp| (stamp, index)))
            .min();
        let Some((stamp, index)) = oldest else {
            return false;
        };
        let mut shard = self.lock(index);
        // A concurrent read may have promoted it; the caller rescans.
        if shard.oldest_stamp() == Some(stamp) {
            shard.lru.pop_lru();
        }
        true
    }

    pub fn clear(&self) {
        for index in 0..self.shards.len() {
            self.lock(index).lru.clear();
        }
    }

    pub fn len(&self) -> usize {
        (0..self.shards.len())
            .map(|index| self.lock(index).lru.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock(Self::shard_of(key)).lru.contains(key)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size: self.len(),
            max_size: self.max_size,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(q: &str) -> CacheKey {
        CacheKey {
            query: q.to_string(),
            k: 5,
            platform: None,
            category: None,
        }
    }

    #[test]
    fn test_hit_and_miss_counting() {
        let cache = QueryCache::new(4);
        assert_eq!(cache.get(1, &key("a")), None);
        cache.put(1, key("a"), 10);
        assert_eq!(cache.get(1, &key("a")), Some(10));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_filters_are_part_of_key() {
        let cache = QueryCache::new(4);
        cache.put(1, key("disk"), 1);
        let mut linux = key("disk");
        linux.platform = Some("linux".into());
        assert_eq!(cache.get(1, &linux), None);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = QueryCache::new(3);
        cache.put(1, key("a"), 1);
        cache.put(1, key("b"), 2);
        cache.put(1, key("c"), 3);
        // Reading "a" makes "b" the oldest.
        cache.get(1, &key("a"));
        cache.put(1, key("d"), 4);

        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("a")));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_new_generation_clears_everything() {
        let cache = QueryCache::new(4);
        cache.put(1, key("a"), 1);
        assert_eq!(cache.get(2, &key("a")), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stale_generation_insert_ignored() {
        let cache = QueryCache::new(4);
        cache.get(3, &key("x"));
        cache.put(2, key("a"), 1);
        assert!(cache.is_empty());
        cache.put(3, key("a"), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_is_global_across_shards() {
        let keys: Vec<CacheKey> = (0..16).map(|i| key(&format!("q{}", i))).collect();
        let used: std::collections::HashSet<usize> =
            keys.iter().map(QueryCache::<u32>::shard_of).collect();
        assert!(used.len() > 1);

        let cache = QueryCache::new(keys.len());
        for (i, k) in keys.iter().enumerate() {
            cache.put(1, k.clone(), i);
        }
        // Touch everything except q5, which becomes the oldest wherever it lives.
        for (i, k) in keys.iter().enumerate() {
            if i != 5 {
                cache.get(1, k);
            }
        }
        cache.put(1, key("fresh"), 99);

        assert_eq!(cache.len(), keys.len());
        assert!(!cache.contains(&key("q5")));
        assert!(cache.contains(&key("q0")));
        assert!(cache.contains(&key("fresh")));
    }

    #[test]
    fn test_concurrent_use_stays_bounded() {
        let cache = std::sync::Arc::new(QueryCache::new(32));
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let k = key(&format!("w{}-{}", worker, i % 64));
                        if cache.get(1, &k).is_none() {
                            cache.put(1, k, i);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = cache.stats();
        assert!(stats.size <= 32);
        assert_eq!(stats.hits + stats.misses, 8 * 500);
    }

    proptest! {
        #[test]
        fn prop_max_size_plus_one_evicts_exactly_first(max in 1usize..40) {
            let cache = QueryCache::new(max);
            for i in 0..=max {
                cache.put(1, key(&format!("q{}", i)), i);
            }
            prop_assert_eq!(cache.len(), max);
            prop_assert!(!cache.contains(&key("q0")));
            for i in 1..=max {
                let present = cache.contains(&key(&format!("q{}", i)));
                prop_assert!(present);
            }
        }

        #[test]
        fn prop_size_never_exceeds_max(max in 1usize..16, ops in prop::collection::vec(0u8..32, 0..200)) {
            let cache = QueryCache::new(max);
            for op in ops {
                let k = key(&format!("q{}", op % 20));
                if op % 2 == 0 {
                    cache.put(1, k, op);
                } else {
                    cache.get(1, &k);
                }
                prop_assert!(cache.len() <= max);
            }
        }
    }
}
