//! Local (filesystem) reader — §4.2.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::blob::ExternalBlobStore;
use crate::cache::{CacheKey, IndexCache, NullIndexCache};
use crate::error::{DesError, DesResult};
use crate::format::{Footer, IndexEntry, FOOTER_SIZE};
use crate::meta;
use crate::writer::EXTERNAL_LOCATION_KEY;

use super::{parse_index, parse_trailing_footer, plan_batches};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderStats {
    pub file_count: u64,
    pub byte_size: u64,
    pub data_length: u64,
    pub meta_length: u64,
    pub index_length: u64,
}

/// One name's outcome in a batch read — never short-circuits the whole
/// batch on a single failure (§7).
pub type BatchResult = Vec<(String, DesResult<Bytes>)>;

/// Footer-first, lazily-indexed reader over a single container file.
/// `&self` methods take `&std::fs::File` reads through `spawn_blocking` so
/// the surface stays `async fn` even though the local filesystem is
/// inherently synchronous.
pub struct LocalReader {
    path: PathBuf,
    object_size: u64,
    footer: Footer,
    entries: Vec<IndexEntry>,
    by_name: HashMap<String, usize>,
    blob_store: Option<Arc<dyn ExternalBlobStore>>,
}

impl LocalReader {
    /// Bootstrap: read the trailing 80 bytes for the footer, then (cache
    /// miss only) the index span. `cache` is consulted/populated under a
    /// key derived from `path` — good enough for a single-process local
    /// reader; the object-store reader's key additionally carries a version.
    pub async fn open<P: AsRef<Path>>(
        path: P,
        cache: Option<Arc<dyn IndexCache>>,
        blob_store: Option<Arc<dyn ExternalBlobStore>>,
    ) -> DesResult<Self> {
        let path = path.as_ref().to_owned();
        let cache = cache.unwrap_or_else(|| Arc::new(NullIndexCache));
        let cache_key = CacheKey::for_path(&path.to_string_lossy());

        let path_for_blocking = path.clone();
        let (object_size, footer, index_bytes) = tokio::task::spawn_blocking(move || -> DesResult<_> {
            let mut file = File::open(&path_for_blocking)?;
            let object_size = file.metadata()?.len();
            if object_size < FOOTER_SIZE as u64 {
                return Err(DesError::CorruptContainer("object is smaller than FOOTER_SIZE".into()));
            }

            let mut tail = vec![0u8; FOOTER_SIZE];
            file.seek(SeekFrom::Start(object_size - FOOTER_SIZE as u64))?;
            file.read_exact(&mut tail)?;
            let footer = parse_trailing_footer(&tail, object_size)?;

            file.seek(SeekFrom::Start(footer.index_start))?;
            let mut index_bytes = vec![0u8; footer.index_length as usize];
            file.read_exact(&mut index_bytes)?;
            Ok((object_size, footer, index_bytes))
        })
        .await
        .map_err(|e| DesError::CorruptContainer(format!("reader bootstrap task panicked: {e}")))??;

        let (entries, by_name) = if let Some(cached) = cache.get(&cache_key).await {
            let mut by_name = HashMap::with_capacity(cached.len());
            for (idx, entry) in cached.iter().enumerate() {
                by_name.insert(entry.name.clone(), idx);
            }
            (cached, by_name)
        } else {
            let (entries, by_name) = parse_index(&index_bytes, &footer)?;
            cache.put(&cache_key, entries.clone(), None).await;
            (entries, by_name)
        };

        Ok(Self {
            path,
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
            container: self.path.to_string_lossy().into_owned(),
            name: name.to_owned(),
        })?;
        Ok(&self.entries[*idx])
    }

    pub async fn get_meta(&self, name: &str) -> DesResult<Value> {
        let entry = self.entry(name)?.clone();
        let path = self.path.clone();
        let bytes = tokio::task::spawn_blocking(move || -> DesResult<Vec<u8>> {
            let mut file = File::open(&path)?;
            file.seek(SeekFrom::Start(entry.meta_offset))?;
            let mut len_buf = [0u8; 4];
            file.read_exact(&mut len_buf)?;
            let declared_len = u32::from_le_bytes(len_buf);
            if declared_len != entry.meta_length {
                return Err(DesError::CorruptContainer(format!(
                    "meta length prefix {declared_len} != index meta_length {}",
                    entry.meta_length
                )));
            }
            let mut buf = vec![0u8; declared_len as usize];
            file.read_exact(&mut buf)?;
            Ok(buf)
        })
        .await
        .map_err(|e| DesError::CorruptContainer(format!("meta read task panicked: {e}")))??;
        meta::decode(&bytes)
    }

    pub async fn get(&self, name: &str) -> DesResult<Bytes> {
        let entry = self.entry(name)?.clone();
        if entry.is_external() {
            return self.fetch_external(&entry).await;
        }
        let path = self.path.clone();
        let bytes = tokio::task::spawn_blocking(move || -> DesResult<Vec<u8>> {
            let mut file = File::open(&path)?;
            file.seek(SeekFrom::Start(entry.data_offset))?;
            let mut buf = vec![0u8; entry.data_length as usize];
            file.read_exact(&mut buf)?;
            Ok(buf)
        })
        .await
        .map_err(|e| DesError::CorruptContainer(format!("data read task panicked: {e}")))??;
        Ok(Bytes::from(bytes))
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

    /// Batch read with gap merging (§4.2). Output preserves `names`' order;
    /// each entry is its own `Ok`/`Err` so one bad name never sinks the rest.
    pub async fn get_many(&self, names: &[String], max_gap: u64) -> BatchResult {
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
            let path = self.path.clone();
            let start = group.start;
            let len = group.len;
            let read = tokio::task::spawn_blocking(move || -> DesResult<Vec<u8>> {
                let mut file = File::open(&path)?;
                file.seek(SeekFrom::Start(start))?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf)?;
                Ok(buf)
            })
            .await
            .map_err(|e| DesError::CorruptContainer(format!("batch read task panicked: {e}")));

            match read {
                Ok(Ok(buf)) => {
                    for (req_idx, offset, length) in group.members {
                        let slice = buf[offset as usize..(offset + length) as usize].to_vec();
                        results[req_idx] = Some(Ok(Bytes::from(slice)));
                    }
                }
                Ok(Err(e)) | Err(e) => {
                    for (req_idx, _, _) in group.members {
                        results[req_idx] = Some(Err(clone_err(&e)));
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

/// `DesError` is not `Clone` (it wraps `io::Error`); when a single group
/// read fails, every member needs its own copy of the failure to report.
fn clone_err(e: &DesError) -> DesError {
    DesError::Transient(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{ContainerWriter, WriteOptions};
    use serde_json::json;
    use tempfile::tempdir;

    async fn write_sample(path: &Path) {
        let mut w = ContainerWriter::open(path, "ctr1".into(), WriteOptions::default(), None).unwrap();
        w.add("a.txt", b"hello", &json!({"mime": "text/plain"})).await.unwrap();
        w.add("b.bin", &vec![7u8; 256], &json!({})).await.unwrap();
        w.finalize().unwrap();
    }

    #[tokio::test]
    async fn round_trips_tiny_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.des");
        write_sample(&path).await;

        let reader = LocalReader::open(&path, None, None).await.unwrap();
        assert_eq!(reader.list(), vec!["a.txt", "b.bin"]);
        assert_eq!(&reader.get("a.txt").await.unwrap()[..], b"hello");
        assert_eq!(reader.get("b.bin").await.unwrap().len(), 256);
        assert_eq!(reader.stats().file_count, 2);
    }

    #[tokio::test]
    async fn get_many_preserves_order_and_reports_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.des");
        write_sample(&path).await;

        let reader = LocalReader::open(&path, None, None).await.unwrap();
        let names = vec!["b.bin".to_string(), "missing".to_string(), "a.txt".to_string()];
        let results = reader.get_many(&names, 1024).await;
        assert_eq!(results[0].0, "b.bin");
        assert!(results[0].1.is_ok());
        assert_eq!(results[1].0, "missing");
        assert!(matches!(results[1].1, Err(DesError::NotFound { .. })));
        assert_eq!(results[2].0, "a.txt");
        assert_eq!(&results[2].1.as_ref().unwrap()[..], b"hello");
    }
}
