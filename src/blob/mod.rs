//! External blob handle — sidecar storage for files diverted out of DATA.
//!
//! When a file's body exceeds [`crate::writer::WriteOptions::big_file_threshold`],
//! the writer never appends it to DATA; instead it hands the bytes to an
//! [`ExternalBlobStore`] and records an index entry with
//! [`crate::format::FLAG_EXTERNAL`] set, `data_length = 0`. Readers do the
//! mirror operation: an external entry is resolved through the same trait
//! instead of a byte-range read.
//!
//! This is the one seam where the writer and the reader both depend on an
//! object-store-shaped capability without depending on each other — per
//! the cyclic-collaborator-graph note in spec §9, the blob handle is taken
//! by value at construction, never wired back into the writer/reader after
//! the fact.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::{DesError, DesResult};

/// Conservative percent-encode set for file names embedded in object keys:
/// controls plus the characters object store path segments treat specially.
const ENCODE_SET: &AsciiSet = &CONTROLS.add(b'/').add(b'%').add(b'?').add(b'#').add(b' ');

/// Capability boundary for reading/writing "big file" bodies kept outside
/// the container. Implemented once against `object_store`; tests use
/// `object_store::memory::InMemory`.
#[async_trait]
pub trait ExternalBlobStore: Send + Sync {
    async fn put(&self, location: &str, bytes: Bytes) -> DesResult<()>;
    async fn get(&self, location: &str) -> DesResult<Bytes>;
}

/// Build the sidecar key for an external file, per spec §6.2:
/// `_bigFiles/<container_id>/<encoded-name>`.
pub fn sidecar_location(container_id: &str, name: &str) -> String {
    let encoded_name = utf8_percent_encode(name, ENCODE_SET).to_string();
    format!("_bigFiles/{container_id}/{encoded_name}")
}

/// `ExternalBlobStore` backed by any `object_store::ObjectStore` — the
/// archive bucket's own client, scoped by the caller to the archive prefix.
pub struct ObjectStoreBlob {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlob {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ExternalBlobStore for ObjectStoreBlob {
    async fn put(&self, location: &str, bytes: Bytes) -> DesResult<()> {
        let path = ObjectPath::from(location);
        self.store
            .put(&path, bytes.into())
            .await
            .map_err(|e| DesError::ExternalFetchFailed(format!("put {location} failed: {e}")))?;
        Ok(())
    }

    async fn get(&self, location: &str) -> DesResult<Bytes> {
        let path = ObjectPath::from(location);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| DesError::ExternalFetchFailed(format!("get {location} failed: {e}")))?;
        result
            .bytes()
            .await
            .map_err(|e| DesError::ExternalFetchFailed(format!("read {location} body failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_unsafe_characters_in_names() {
        let loc = sidecar_location("ctr123", "reports/q1 summary.csv");
        assert_eq!(loc, "_bigFiles/ctr123/reports%2Fq1%20summary.csv");
    }

    #[tokio::test]
    async fn round_trips_through_in_memory_store() {
        let store: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let blob = ObjectStoreBlob::new(store);
        let loc = sidecar_location("ctr1", "big.bin");
        blob.put(&loc, Bytes::from_static(b"payload")).await.unwrap();
        let got = blob.get(&loc).await.unwrap();
        assert_eq!(&got[..], b"payload");
    }
}
