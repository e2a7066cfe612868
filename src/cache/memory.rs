//! In-process index cache: bounded LRU with an optional per-entry TTL.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;

use crate::format::IndexEntry;

use super::{CacheKey, IndexCache};

struct Slot {
    entries: Vec<IndexEntry>,
    inserted_at: Instant,
    ttl: Option<Duration>,
}

impl Slot {
    fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.inserted_at.elapsed() > ttl,
            None => false,
        }
    }
}

/// Thread-safe bounded LRU. The lock is only ever held across a `HashMap`-ish
/// lookup/insert, never across an `.await`, so a plain `std::sync::Mutex`
/// is enough — no need to pull in an async mutex for this.
pub struct MemoryIndexCache {
    inner: Mutex<LruCache<String, Slot>>,
}

impl MemoryIndexCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl IndexCache for MemoryIndexCache {
    async fn get(&self, key: &CacheKey) -> Option<Vec<IndexEntry>> {
        let mut guard = self.inner.lock().unwrap();
        match guard.get(key.as_str()) {
            Some(slot) if slot.is_expired() => {
                guard.pop(key.as_str());
                None
            }
            Some(slot) => Some(slot.entries.clone()),
            None => None,
        }
    }

    async fn put(&self, key: &CacheKey, entries: Vec<IndexEntry>, ttl: Option<Duration>) {
        let mut guard = self.inner.lock().unwrap();
        guard.put(
            key.as_str().to_owned(),
            Slot {
                entries,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::IndexEntry;

    fn entry(name: &str) -> IndexEntry {
        IndexEntry {
            name: name.into(),
            data_offset: 16,
            data_length: 5,
            meta_offset: 21,
            meta_length: 2,
            flags: 0,
        }
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let cache = MemoryIndexCache::new(1);
        let k1 = CacheKey::for_path("a");
        let k2 = CacheKey::for_path("b");
        cache.put(&k1, vec![entry("a.txt")], None).await;
        cache.put(&k2, vec![entry("b.txt")], None).await;
        assert!(cache.get(&k1).await.is_none());
        assert!(cache.get(&k2).await.is_some());
    }

    #[tokio::test]
    async fn expires_after_ttl() {
        let cache = MemoryIndexCache::new(4);
        let key = CacheKey::for_path("a");
        cache.put(&key, vec![entry("a.txt")], Some(Duration::from_millis(1))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get(&key).await.is_none());
    }
}
