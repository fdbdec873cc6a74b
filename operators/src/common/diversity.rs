use lru::LruCache;
use std::{hash::Hash, num::NonZeroUsize};

/// 各级缓存的容量配置。
#[derive(Clone, Debug)]
pub struct CacheSize {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

impl Default for CacheSize {
    fn default() -> Self {
        Self {
            low: 4,
            medium: 16,
            high: 64,
        }
    }
}

/// 被缓存对象的预期多样性。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheLevel {
    Low,
    Medium,
    High,
}

impl CacheSize {
    pub fn capacity(&self, level: CacheLevel) -> usize {
        match level {
            CacheLevel::Low => self.low,
            CacheLevel::Medium => self.medium,
            CacheLevel::High => self.high,
        }
    }

    pub fn new_cache<K: Hash + Eq, V>(&self, level: CacheLevel) -> LruCache<K, V> {
        match NonZeroUsize::new(self.capacity(level)) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        }
    }
}

#[test]
fn test_capacity() {
    let size = CacheSize {
        low: 0,
        ..Default::default()
    };
    let mut cache = size.new_cache::<u32, u32>(CacheLevel::Medium);
    assert_eq!(cache.cap().get(), 16);
    for i in 0..20 {
        cache.put(i, i);
    }
    assert_eq!(cache.len(), 16);
    assert!(cache.get(&0).is_none());
    assert_eq!(cache.get(&19), Some(&19));

    let unbounded = size.new_cache::<u32, u32>(CacheLevel::Low);
    assert_eq!(unbounded.cap().get(), usize::MAX);
}
