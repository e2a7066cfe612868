//! Typed accessor over the relational metadata store — §4.7 / §6.3.
//!
//! Two tables, `shard_leases` and `containers`; every operation listed here
//! must be atomic on its own (the contract doesn't require cross-operation
//! transactions, only that each one individually can't race itself).

pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;

use crate::error::DesResult;

pub use sql::PostgresMetadataStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLease {
    pub shard_id: u32,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub ttl_seconds: u32,
    pub generation: u64,
}

impl ShardLease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.heartbeat_at + chrono::Duration::seconds(self.ttl_seconds as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Open,
    Uploading,
    Committed,
    Abandoned,
}

impl ContainerState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ContainerState::Open => "OPEN",
            ContainerState::Uploading => "UPLOADING",
            ContainerState::Committed => "COMMITTED",
            ContainerState::Abandoned => "ABANDONED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "OPEN" => ContainerState::Open,
            "UPLOADING" => ContainerState::Uploading,
            "COMMITTED" => ContainerState::Committed,
            "ABANDONED" => ContainerState::Abandoned,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub container_id: String,
    pub shard_id: u32,
    pub day: NaiveDate,
    pub bucket: String,
    pub key: String,
    pub state: ContainerState,
    pub file_count: u64,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
    pub committed_at: Option<DateTime<Utc>>,
    pub owner_id: String,
    pub generation: u64,
}

/// Every method is its own atomic unit of work; implementations are
/// expected to use row-level locking or `SERIALIZABLE` isolation as needed
/// to keep `try_acquire` race-free under concurrent callers (§8.5).
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Succeeds iff no lease is held for `shard_id`, or the held one is
    /// expired. On success, increments `generation`.
    async fn try_acquire(&self, shard_id: u32, owner_id: &str, ttl: Duration) -> DesResult<Option<ShardLease>>;

    /// Updates `heartbeat_at` iff `(shard_id, owner_id, generation)` still
    /// holds the lease. Returns `false` (not an error) on loss.
    async fn renew(&self, shard_id: u32, owner_id: &str, generation: u64) -> DesResult<bool>;

    /// Clears the lease iff still held by `(owner_id, generation)`.
    async fn release(&self, shard_id: u32, owner_id: &str, generation: u64) -> DesResult<()>;

    /// Inserts a new container record in state `OPEN`.
    async fn create_container(&self, record: &ContainerRecord) -> DesResult<()>;

    /// `OPEN -> UPLOADING -> COMMITTED`; only `COMMITTED` rows are visible
    /// to readers regardless of how many internal steps this takes.
    async fn mark_uploaded(&self, container_id: &str, file_count: u64, byte_size: u64) -> DesResult<()>;

    /// Any non-`COMMITTED` state transitions to `ABANDONED`.
    async fn abandon(&self, container_id: &str) -> DesResult<()>;

    /// Periodic checkpoint during packing — updates `file_count`/`byte_size`
    /// on an `OPEN` row without touching its state.
    async fn checkpoint(&self, container_id: &str, file_count: u64, byte_size: u64) -> DesResult<()>;

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> DesResult<Vec<ShardLease>>;

    /// Leases not expired as of `now` — crash recovery uses this to decide
    /// whether a shard's claimed source rows still have a live owner.
    async fn list_active_leases(&self, now: DateTime<Utc>) -> DesResult<Vec<ShardLease>>;

    async fn list_stale_containers(&self, age: Duration) -> DesResult<Vec<ContainerRecord>>;
}
