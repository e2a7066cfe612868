//! External key-value-backed index cache.
//!
//! The KV system itself (Redis, memcached, a shared object-store prefix...)
//! is an external collaborator — this module only specifies the capability
//! it needs (`KvStore`) and the wire format layered on top: JSON-serialized
//! entries, optionally gzip-compressed, with an optional TTL passed through
//! to the store's own expiry mechanism.

use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::format::IndexEntry;

use super::{CacheKey, IndexCache};

/// Narrow capability an external KV system must expose. `put` receives a
/// pre-serialized blob and an optional TTL; the store owns expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn kv_get(&self, key: &str) -> Option<Vec<u8>>;
    async fn kv_put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>);
}

/// Wraps any `KvStore` with the index cache's serialization contract.
pub struct ExternalIndexCache<K: KvStore> {
    store: K,
    gzip: bool,
}

impl<K: KvStore> ExternalIndexCache<K> {
    pub fn new(store: K, gzip: bool) -> Self {
        Self { store, gzip }
    }

    fn encode(&self, entries: &[IndexEntry]) -> Vec<u8> {
        let json = serde_json::to_vec(entries).expect("IndexEntry JSON encoding cannot fail");
        if self.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json).expect("in-memory gzip write cannot fail");
            encoder.finish().expect("in-memory gzip finish cannot fail")
        } else {
            json
        }
    }

    fn decode(&self, bytes: &[u8]) -> Option<Vec<IndexEntry>> {
        let json = if self.gzip {
            let mut decoder = GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).ok()?;
            out
        } else {
            bytes.to_vec()
        };
        serde_json::from_slice(&json).ok()
    }
}

#[async_trait]
impl<K: KvStore> IndexCache for ExternalIndexCache<K> {
    async fn get(&self, key: &CacheKey) -> Option<Vec<IndexEntry>> {
        let raw = self.store.kv_get(key.as_str()).await?;
        self.decode(&raw)
    }

    async fn put(&self, key: &CacheKey, entries: Vec<IndexEntry>, ttl: Option<Duration>) {
        let blob = self.encode(&entries);
        self.store.kv_put(key.as_str(), blob, ttl).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct InMemoryKv {
        map: Mutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl KvStore for InMemoryKv {
        async fn kv_get(&self, key: &str) -> Option<Vec<u8>> {
            self.map.lock().unwrap().get(key).cloned()
        }

        async fn kv_put(&self, key: &str, value: Vec<u8>, _ttl: Option<Duration>) {
            self.map.lock().unwrap().insert(key.to_owned(), value);
        }
    }

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
    async fn round_trips_with_and_without_gzip() {
        for gzip in [false, true] {
            let kv = InMemoryKv {
                map: Mutex::new(std::collections::HashMap::new()),
            };
            let cache = ExternalIndexCache::new(kv, gzip);
            let key = CacheKey::for_object("bucket", "2024-01-01/3/ctr.des", "etag1");
            cache.put(&key, vec![entry("a.txt"), entry("b.bin")], None).await;
            let got = cache.get(&key).await.expect("cache hit");
            assert_eq!(got.len(), 2);
        }
    }

    #[tokio::test]
    async fn miss_on_unknown_key() {
        let kv = InMemoryKv {
            map: Mutex::new(std::collections::HashMap::new()),
        };
        let cache = ExternalIndexCache::new(kv, false);
        let key = CacheKey::for_object("bucket", "missing", "etag");
        assert!(cache.get(&key).await.is_none());
    }
}
