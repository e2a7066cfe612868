//! Range reader — §4.3. Mirrors `reader::local::LocalReader`'s surface
//! against an `object_store::ObjectStore` instead of the filesystem.

use std::collections::HashMap;
use std::ops::Range as StdRange;
use std::sync::Arc;

use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde_json::Value;

use crate::blob::ExternalBlobStore;
use crate::cache::{CacheKey, IndexCache, NullIndexCache};
use crate::error::{DesError, DesResult};
use crate::format::{Footer, IndexEntry, FOOTER_SIZE};
use crate::meta;
use crate::reader::local::{BatchResult, ReaderStats};
use crate::reader::{parse_index, parse_trailing_footer, plan_batches};
use crate::writer::EXTERNAL_LOCATION_KEY;

/// Default gap budget for the range reader: 1 MiB, justified by
/// egress/request-count economics rather than disk-seek cost (§4.3).
pub const DEFAULT_MAX_GAP: u64 = 1024 * 1024;

/// `{bucket, key, version}` — the range reader's cache key. A changed
/// version is a different key, so a stale index can never be served.
fn object_version(meta: &object_store::ObjectMeta) -> String {
    meta.e_tag
        .clone()
        .or_else(|| meta.version.clone())
        .unwrap_or_else(|| format!("{}:{}", meta.size, meta.last_modified.timestamp_nanos_opt().unwrap_or_default()))
}

pub struct RangeReader {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    bucket: String,
    object_size: u64,
    footer: Footer,
    entries: Vec<IndexEntry>,
    by_name: HashMap<String, usize>,
    blob_store: Option<Arc<dyn ExternalBlobStore>>,
}

impl RangeReader {
    /// Bootstrap: `HEAD` for size + version, one Range GET for the trailing
    /// FOOTER, and (cache miss only) one Range GET for the INDEX span.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        bucket: String,
        key: &str,
        cache: Option<Arc<dyn IndexCache>>,
        blob_store: Option<Arc<dyn ExternalBlobStore>>,
    ) -> DesResult<Self> {
        let path = ObjectPath::from(key);
        let cache = cache.unwrap_or_else(|| Arc::new(NullIndexCache));

        let head = store
            .head(&path)
            .await
            .map_err(|e| DesError::ExternalFetchFailed(format!("HEAD {key} failed: {e}")))?;
        let object_size = head.size as u64;
        if object_size < FOOTER_SIZE as u64 {
            return Err(DesError::CorruptContainer("object is smaller than FOOTER_SIZE".into()));
        }
        let version = object_version(&head);
        let cache_key = CacheKey::for_object(&bucket, key, &version);

        let tail = get_range(&store, &path, object_size - FOOTER_SIZE as u64..object_size, key).await?;
        let footer = parse_trailing_footer(&tail, object_size)?;

        let (entries, by_name) = if let Some(cached) = cache.get(&cache_key).await {
            let mut by_name = HashMap::with_capacity(cached.len());
            for (idx, entry) in cached.iter().enumerate() {
                by_name.insert(entry.name.clone(), idx);
            }
            (cached, by_name)
        } else {
            let index_bytes = get_range(
                &store,
                &path,
                footer.index_start..footer.index_start + footer.index_length,
                key,
            )
            .await?;
            let (entries, by_name) = parse_index(&index_bytes, &footer)?;
            cache.put(&cache_key, entries.clone(), None).await;
            (entries, by_name)
        };

        Ok(Self {
            store,
            path,
            bucket,
            object_size,
            footer,
            entries,
            by_name,
            blob_store,
        })
    }

    pub fn list(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn stats(&self) -> ReaderStats {
        ReaderStats {
            file_count: self.footer.file_count,
            byte_size: self.object_size,
            data_length: self.footer.data_length,
            meta_length: self.footer.meta_length,
            index_length: self.footer.index_length,
        }
    }

    fn entry(&self, name: &str) -> DesResult<&IndexEntry> {
        let idx = self.by_name.get(name).ok_or_else(|| DesError::NotFound {
            container: self.path.to_string(),
            name: name.to_owned(),
        })?;
        Ok(&self.entries[*idx])
    }

    pub async fn get_meta(&self, name: &str) -> DesResult<Value> {
        let entry = self.entry(name)?;
        let buf = get_range(
            &self.store,
            &self.path,
            entry.meta_offset..entry.meta_offset + 4 + entry.meta_length as u64,
            self.path.as_ref(),
        )
        .await?;
        let declared_len = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if declared_len != entry.meta_length {
            return Err(DesError::CorruptContainer(format!(
                "meta length prefix {declared_len} != index meta_length {}",
                entry.meta_length
            )));
        }
        meta::decode(&buf[4..])
    }

    pub async fn get(&self, name: &str) -> DesResult<Bytes> {
        let entry = self.entry(name)?.clone();
        if entry.is_external() {
            return self.fetch_external(&entry).await;
        }
        get_range(
            &self.store,
            &self.path,
            entry.data_offset..entry.data_offset + entry.data_length,
            self.path.as_ref(),
        )
        .await
    }

    async fn fetch_external(&self, entry: &IndexEntry) -> DesResult<Bytes> {
        let store = self
            .blob_store
            .as_ref()
            .ok_or_else(|| DesError::ConfigError(format!("{:?} is external but no blob store is configured", entry.name)))?;
        let meta_value = self.get_meta(&entry.name).await?;
        let location = meta_value
            .get(EXTERNAL_LOCATION_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| DesError::CorruptContainer(format!("{:?} is external but meta has no sidecar location", entry.name)))?;
        store.get(location).await
    }

    /// Batch read with gap merging, defaulting to [`DEFAULT_MAX_GAP`] when
    /// `max_gap` is `None`.
    pub async fn get_many(&self, names: &[String], max_gap: Option<u64>) -> BatchResult {
        let max_gap = max_gap.unwrap_or(DEFAULT_MAX_GAP);
        let mut results: Vec<Option<DesResult<Bytes>>> = vec![None; names.len()];
        let mut internal_requests: Vec<(usize, &IndexEntry)> = Vec::new();

        for (idx, name) in names.iter().enumerate() {
            match self.entry(name) {
                Ok(entry) if entry.is_external() => {
                    results[idx] = Some(self.fetch_external(entry).await);
                }
                Ok(entry) => internal_requests.push((idx, entry)),
                Err(e) => results[idx] = Some(Err(e)),
            }
        }

        let groups = plan_batches(&internal_requests, max_gap);
        for group in groups {
            let read = get_range(&self.store, &self.path, group.start..group.start + group.len, self.path.as_ref()).await;
            match read {
                Ok(buf) => {
                    for (req_idx, offset, length) in group.members {
                        let slice = buf.slice(offset as usize..(offset + length) as usize);
                        results[req_idx] = Some(Ok(slice));
                    }
                }
                Err(e) => {
                    for (req_idx, _, _) in group.members {
                        results[req_idx] = Some(Err(DesError::Transient(e.to_string())));
                    }
                }
            }
        }

        names
            .iter()
            .cloned()
            .zip(results.into_iter().map(|r| r.expect("every request index is resolved")))
            .collect()
    }
}

async fn get_range(store: &Arc<dyn ObjectStore>, path: &ObjectPath, range: StdRange<u64>, label: &str) -> DesResult<Bytes> {
    let range = range.start as usize..range.end as usize;
    store
        .get_range(path, range)
        .await
        .map_err(|e| DesError::ExternalFetchFailed(format!("range GET on {label} failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{ContainerWriter, WriteOptions};
    use object_store::memory::InMemory;
    use serde_json::json;

    #[tokio::test]
    async fn bootstraps_and_reads_from_in_memory_store() {
        let mut buf = Vec::new();
        {
            let mut w = ContainerWriter::new(&mut buf, "ctr1".into(), WriteOptions::default(), None).unwrap();
            w.add("a.txt", b"hello", &json!({})).await.unwrap();
            w.finalize().unwrap();
        }

        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        store
            .put(&ObjectPath::from("2024-01-01/0/ctr1.des"), buf.into())
            .await
            .unwrap();

        let reader = RangeReader::open(store, "archive".into(), "2024-01-01/0/ctr1.des", None, None)
            .await
            .unwrap();
        assert_eq!(reader.list(), vec!["a.txt"]);
        assert_eq!(&reader.get("a.txt").await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn rejects_truncated_object() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        store.put(&ObjectPath::from("bad.des"), vec![0u8; 10].into()).await.unwrap();
        let err = RangeReader::open(store, "archive".into(), "bad.des", None, None).await.unwrap_err();
        assert!(matches!(err, DesError::CorruptContainer(_)));
    }
}
