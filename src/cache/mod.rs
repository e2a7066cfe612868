//! Index cache abstraction (§4.4) — one capability, two implementations.
//!
//! A cache holds the parsed INDEX region for a container, keyed by the
//! container's identity so a changed object (new etag/version) never serves
//! a stale index. It is advisory everywhere it's consulted: a miss costs one
//! extra range request, never a failed read.

pub mod external;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::format::IndexEntry;

pub use external::ExternalIndexCache;
pub use memory::MemoryIndexCache;

/// Identifies one container's index for caching purposes. Local containers
/// key on their path; object-store containers key on `{bucket, key,
/// version}` per §4.3 — a changed version invalidates the cached entry by
/// construction, since it's a different key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_path(path: &str) -> Self {
        Self(format!("path:{path}"))
    }

    pub fn for_object(bucket: &str, key: &str, version: &str) -> Self {
        Self(format!("obj:{bucket}:{key}:{version}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Shared contract between the in-process and external-KV caches. A `get`
/// miss is not an error — callers fall back to parsing the index from the
/// container itself and, on success, `put` it back.
#[async_trait]
pub trait IndexCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<Vec<IndexEntry>>;
    async fn put(&self, key: &CacheKey, entries: Vec<IndexEntry>, ttl: Option<Duration>);
}

/// A no-op cache for callers that pass `cache: None` to `open` — keeps the
/// reader code from special-casing "no cache configured".
pub struct NullIndexCache;

#[async_trait]
impl IndexCache for NullIndexCache {
    async fn get(&self, _key: &CacheKey) -> Option<Vec<IndexEntry>> {
        None
    }

    async fn put(&self, _key: &CacheKey, _entries: Vec<IndexEntry>, _ttl: Option<Duration>) {}
}
