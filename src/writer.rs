//! Container writer — the append-only builder behind §4.1.
//!
//! `ContainerWriter` never seeks: HEADER is a fixed constant, DATA is
//! appended as files arrive, and META/INDEX/FOOTER are all written once, in
//! order, from `finalize`. That's what makes the format genuinely
//! append-only instead of "append, then patch a few offsets at the front"
//! the way the teacher's `.6cy` superblock does — DES has nothing at offset
//! 0 that depends on anything written later.

use std::collections::HashSet;
use std::fs::File;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::blob::{sidecar_location, ExternalBlobStore};
use crate::error::{DesError, DesResult};
use crate::format::{footer::Footer, header::Header, index_entry::validate_name, IndexEntry, FLAG_EXTERNAL};
use crate::meta;

/// Default threshold above which a file's body is diverted to the external
/// blob sidecar instead of DATA: 100 MiB.
pub const DEFAULT_BIG_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Meta key under which an external file's sidecar location is stashed —
/// the index entry has nowhere else to carry it (§3.2).
pub const EXTERNAL_LOCATION_KEY: &str = "_external_location";

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub big_file_threshold: u64,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            big_file_threshold: DEFAULT_BIG_FILE_THRESHOLD,
        }
    }
}

/// Stats returned by `finalize`, per §4.1.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub file_count: u64,
    pub byte_size: u64,
    pub data_length: u64,
    pub meta_length: u64,
    pub index_length: u64,
}

struct PendingEntry {
    name: String,
    data_offset: u64,
    data_length: u64,
    meta_bytes: Vec<u8>,
    flags: u32,
}

/// Append-only single-owner builder. `add`/`finalize`/`abort` are not safe
/// to call concurrently on the same handle (spec §4.1's "single-owner"
/// rule) — the type has no internal synchronization and relies on `&mut
/// self` to enforce that at compile time.
pub struct ContainerWriter<W: Write> {
    writer: W,
    path: Option<PathBuf>,
    pos: u64,
    names: HashSet<String>,
    pending: Vec<PendingEntry>,
    blob_store: Option<Arc<dyn ExternalBlobStore>>,
    container_id: String,
    options: WriteOptions,
    finalized: bool,
}

impl ContainerWriter<File> {
    /// Open a file-backed writer at `path`, truncating/creating it, and
    /// write HEADER immediately.
    pub fn open<P: AsRef<Path>>(
        path: P,
        container_id: String,
        options: WriteOptions,
        blob_store: Option<Arc<dyn ExternalBlobStore>>,
    ) -> DesResult<Self> {
        let path = path.as_ref().to_owned();
        let file = File::create(&path)?;
        let mut w = Self::new(file, container_id, options, blob_store)?;
        w.path = Some(path);
        Ok(w)
    }
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(
        mut writer: W,
        container_id: String,
        options: WriteOptions,
        blob_store: Option<Arc<dyn ExternalBlobStore>>,
    ) -> DesResult<Self> {
        Header::default().write(&mut writer)?;
        Ok(Self {
            writer,
            path: None,
            pos: crate::format::DATA_START,
            names: HashSet::new(),
            pending: Vec::new(),
            blob_store,
            container_id,
            options,
            finalized: false,
        })
    }

    /// Append one file. Bytes and the canonicalized `meta` JSON are both
    /// recorded now; the INDEX/META regions are only materialized in
    /// `finalize`. Files at or above `big_file_threshold` are diverted to
    /// the external blob sidecar instead of DATA (spec §3.2).
    pub async fn add(&mut self, name: &str, bytes: &[u8], meta_value: &Value) -> DesResult<()> {
        validate_name(name)?;
        if self.names.contains(name) {
            return Err(DesError::NameConflict(name.to_owned()));
        }

        let (data_offset, data_length, flags, meta_bytes) = if bytes.len() as u64 >= self.options.big_file_threshold {
            let store = self.blob_store.as_ref().ok_or_else(|| {
                DesError::ConfigError(
                    "file exceeds big_file_threshold but no external blob store is configured".into(),
                )
            })?;
            let location = sidecar_location(&self.container_id, name);
            store.put(&location, bytes::Bytes::copy_from_slice(bytes)).await?;

            // The index entry carries no offset for an external file, so the
            // sidecar location is stashed in meta instead — it's the only
            // place a reader can recover it from.
            let mut augmented = meta_value.clone();
            if let Value::Object(map) = &mut augmented {
                map.insert(EXTERNAL_LOCATION_KEY.to_owned(), Value::String(location));
            }
            let meta_bytes = meta::encode(&augmented)?;
            (0, 0, FLAG_EXTERNAL, meta_bytes)
        } else {
            let offset = self.pos;
            self.writer.write_all(bytes)?;
            self.pos += bytes.len() as u64;
            let meta_bytes = meta::encode(meta_value)?;
            (offset, bytes.len() as u64, 0, meta_bytes)
        };

        self.names.insert(name.to_owned());
        self.pending.push(PendingEntry {
            name: name.to_owned(),
            data_offset,
            data_length,
            meta_bytes,
            flags,
        });
        Ok(())
    }

    /// Write META, then INDEX, then FOOTER, then flush. Must be called
    /// exactly once. Returns stats over the finished container.
    pub fn finalize(mut self) -> DesResult<ContainerStats> {
        let data_start = crate::format::DATA_START;
        let data_length = self.pos - data_start;
        let meta_start = self.pos;

        let mut entries = Vec::with_capacity(self.pending.len());
        for pending in &self.pending {
            let meta_offset = self.pos;
            self.writer.write_all(&(pending.meta_bytes.len() as u32).to_le_bytes())?;
            self.writer.write_all(&pending.meta_bytes)?;
            self.pos += 4 + pending.meta_bytes.len() as u64;

            entries.push(IndexEntry {
                name: pending.name.clone(),
                data_offset: pending.data_offset,
                data_length: pending.data_length,
                meta_offset,
                meta_length: pending.meta_bytes.len() as u32,
                flags: pending.flags,
            });
        }
        let meta_length = self.pos - meta_start;

        let index_start = self.pos;
        for entry in &entries {
            entry.write(&mut self.writer)?;
            self.pos += entry.encoded_len() as u64;
        }
        let index_length = self.pos - index_start;

        let footer = Footer {
            data_start,
            data_length,
            meta_start,
            meta_length,
            index_start,
            index_length,
            file_count: entries.len() as u64,
            version: crate::format::FORMAT_VERSION,
        };
        footer.write(&mut self.writer)?;
        self.writer.flush()?;
        self.finalized = true;

        Ok(ContainerStats {
            file_count: entries.len() as u64,
            byte_size: self.pos + crate::format::FOOTER_SIZE as u64,
            data_length,
            meta_length,
            index_length,
        })
    }

    /// Discard the in-progress object. File-backed writers remove the
    /// underlying file; in-memory writers simply drop their buffer. No
    /// committed container record may ever reference an aborted object.
    pub fn abort(mut self) -> io::Result<()> {
        self.finalized = true; // suppress the Drop warning below
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        }
    }

    pub fn file_count(&self) -> usize {
        self.pending.len()
    }

    pub fn bytes_buffered(&self) -> u64 {
        self.pos
    }
}

impl<W: Write> Drop for ContainerWriter<W> {
    fn drop(&mut self) {
        if !self.finalized {
            tracing::warn!(
                container_id = %self.container_id,
                "ContainerWriter dropped without finalize() or abort() — use `with_scoped_writer`"
            );
        }
    }
}

/// Scoped-acquisition helper: runs `body` against a freshly opened
/// file-backed writer, then guarantees `finalize` (on success) or `abort`
/// (on any error) runs — the "every exit path" contract from spec §4.1.
pub async fn with_scoped_writer<P, F, Fut>(
    path: P,
    container_id: String,
    options: WriteOptions,
    blob_store: Option<Arc<dyn ExternalBlobStore>>,
    body: F,
) -> DesResult<ContainerStats>
where
    P: AsRef<Path>,
    F: FnOnce(&mut ContainerWriter<File>) -> Fut,
    Fut: Future<Output = DesResult<()>>,
{
    let mut writer = ContainerWriter::open(path, container_id, options, blob_store)?;
    match body(&mut writer).await {
        Ok(()) => writer.finalize(),
        Err(e) => {
            writer.abort()?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn tiny_archive_round_trips_through_writer() {
        let mut buf = Vec::new();
        {
            let mut w = ContainerWriter::new(&mut buf, "ctr1".into(), WriteOptions::default(), None).unwrap();
            w.add("a.txt", b"hello", &json!({"mime": "text/plain"})).await.unwrap();
            w.add("b.bin", &(0u8..=255).collect::<Vec<u8>>(), &json!({})).await.unwrap();
            let stats = w.finalize().unwrap();
            assert_eq!(stats.file_count, 2);
        }
        assert!(!buf.is_empty());
    }

    #[tokio::test]
    async fn rejects_duplicate_and_invalid_names() {
        let mut buf = Vec::new();
        let mut w = ContainerWriter::new(&mut buf, "ctr1".into(), WriteOptions::default(), None).unwrap();
        w.add("a.txt", b"1", &json!({})).await.unwrap();
        assert!(matches!(w.add("a.txt", b"2", &json!({})).await, Err(DesError::NameConflict(_))));
        assert!(matches!(w.add("../evil", b"3", &json!({})).await, Err(DesError::InvalidName(_, _))));
        w.abort().unwrap();
    }

    #[tokio::test]
    async fn external_diversion_requires_blob_store() {
        let mut buf = Vec::new();
        let mut options = WriteOptions::default();
        options.big_file_threshold = 4;
        let mut w = ContainerWriter::new(&mut buf, "ctr1".into(), options, None).unwrap();
        let err = w.add("big.bin", b"12345", &json!({})).await.unwrap_err();
        assert!(matches!(err, DesError::ConfigError(_)));
    }
}
