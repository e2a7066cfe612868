//! Source provider — §4.8. Claims pending rows from a configured upstream
//! database, fetches their bytes, and reports the packer's outcome back.

pub mod dialect;
pub mod provider;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::DesResult;

pub use dialect::SourceDialect;
pub use provider::SourceProviderImpl;

/// The configured mapping from this source's table columns to DES's
/// required row shape (§6.4).
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    pub id: String,
    pub bucket: String,
    pub key: String,
    pub size_bytes: String,
    pub status: String,
    pub created_at: String,
    /// Column stamped with the claim timestamp every time a row transitions
    /// to `claimed` — what `claim_timeout_seconds` is measured against.
    pub claimed_at: String,
    pub shard_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub dialect: SourceDialect,
    pub table: String,
    pub schema: Option<String>,
    pub mapping: ColumnMapping,
    pub status_pending_value: String,
    pub status_claimed_value: String,
    pub status_packed_value: String,
    pub status_failed_value: String,
    pub shard_bits: u32,
    pub batch_size: usize,
    pub claim_timeout_seconds: u64,
    pub metadata_columns: HashMap<String, String>,
    pub where_clause: Option<String>,
}

impl SourceConfig {
    pub fn qualified_table(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.clone(),
        }
    }
}

/// One claimed row, ready to be fetched and packed.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub id: String,
    pub bucket: String,
    pub key: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub shard_id: u32,
    pub owner_id: String,
    pub claimed_at: DateTime<Utc>,
    pub metadata: Value,
}

impl PendingFile {
    /// The row is `name` in writer terms: its source key, since DES names
    /// files by their source key unless a marker has pre-stamped one via
    /// `metadata`.
    pub fn container_entry_name(&self) -> &str {
        self.metadata
            .get("_des_name")
            .and_then(Value::as_str)
            .unwrap_or(&self.key)
    }
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Claims up to `batch_size` pending rows whose derived shard is in
    /// `shard_ids`, stamping them `claimed` with this provider's owner
    /// identity, and returns them.
    async fn claim(&self, batch_size: usize, shard_ids: &[u32]) -> DesResult<Vec<PendingFile>>;

    async fn fetch(&self, file: &PendingFile) -> DesResult<Bytes>;

    async fn mark_packed(&self, file: &PendingFile, container_id: &str) -> DesResult<()>;

    async fn mark_failed(&self, file: &PendingFile, reason: &str) -> DesResult<()>;

    /// Every row currently stamped `claimed`, regardless of shard — crash
    /// recovery (§4.10 step 3) cross-references these against live leases
    /// itself rather than asking the provider to know about lease state.
    async fn list_claimed(&self) -> DesResult<Vec<PendingFile>>;

    /// Resets one row back to `pending`. Used by crash recovery once it has
    /// determined the row's owning shard holds no active lease.
    async fn reset_to_pending(&self, file: &PendingFile) -> DesResult<()>;
}
