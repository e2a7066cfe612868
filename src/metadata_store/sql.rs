//! Postgres-backed `MetadataStore`.
//!
//! Schema (see DESIGN.md for the full DDL): `shard_leases(shard_id PK,
//! owner_id, acquired_at, heartbeat_at, ttl_seconds, generation)` and
//! `containers(container_id PK, shard_id, day, bucket, key, state,
//! file_count, byte_size, created_at, committed_at, owner_id, generation)`.
//! `try_acquire` runs inside a transaction with `SELECT ... FOR UPDATE` so
//! two concurrent callers racing the same shard serialize on the row lock
//! instead of both succeeding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::error::{DesError, DesResult};

use super::{ContainerRecord, ContainerState, MetadataStore, ShardLease};

pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_sqlx_err(e: sqlx::Error) -> DesError {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => DesError::Permanent(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => DesError::Transient(e.to_string()),
            _ => DesError::Transient(e.to_string()),
        }
    }
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    async fn try_acquire(&self, shard_id: u32, owner_id: &str, ttl: Duration) -> DesResult<Option<ShardLease>> {
        let mut tx = self.pool.begin().await.map_err(Self::map_sqlx_err)?;
        let ttl_seconds = ttl.as_secs() as i64;

        let existing = sqlx::query("SELECT heartbeat_at, ttl_seconds FROM shard_leases WHERE shard_id = $1 FOR UPDATE")
            .bind(shard_id as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Self::map_sqlx_err)?;

        if let Some(row) = &existing {
            let heartbeat_at: DateTime<Utc> = row.try_get("heartbeat_at").map_err(Self::map_sqlx_err)?;
            let held_ttl: i32 = row.try_get("ttl_seconds").map_err(Self::map_sqlx_err)?;
            let expired = Utc::now() > heartbeat_at + chrono::Duration::seconds(held_ttl as i64);
            if !expired {
                tx.rollback().await.map_err(Self::map_sqlx_err)?;
                return Ok(None);
            }
        }

        let row = if existing.is_some() {
            sqlx::query(
                "UPDATE shard_leases
                 SET owner_id = $2, acquired_at = now(), heartbeat_at = now(),
                     ttl_seconds = $3, generation = generation + 1
                 WHERE shard_id = $1
                 RETURNING heartbeat_at, generation",
            )
            .bind(shard_id as i64)
            .bind(owner_id)
            .bind(ttl_seconds as i32)
            .fetch_one(&mut *tx)
            .await
        } else {
            sqlx::query(
                "INSERT INTO shard_leases (shard_id, owner_id, acquired_at, heartbeat_at, ttl_seconds, generation)
                 VALUES ($1, $2, now(), now(), $3, 1)
                 RETURNING heartbeat_at, generation",
            )
            .bind(shard_id as i64)
            .bind(owner_id)
            .bind(ttl_seconds as i32)
            .fetch_one(&mut *tx)
            .await
        }
        .map_err(Self::map_sqlx_err)?;

        let heartbeat_at: DateTime<Utc> = row.try_get("heartbeat_at").map_err(Self::map_sqlx_err)?;
        let generation: i64 = row.try_get("generation").map_err(Self::map_sqlx_err)?;
        tx.commit().await.map_err(Self::map_sqlx_err)?;

        Ok(Some(ShardLease {
            shard_id,
            owner_id: owner_id.to_owned(),
            acquired_at: heartbeat_at,
            heartbeat_at,
            ttl_seconds: ttl_seconds as u32,
            generation: generation as u64,
        }))
    }

    async fn renew(&self, shard_id: u32, owner_id: &str, generation: u64) -> DesResult<bool> {
        let result = sqlx::query(
            "UPDATE shard_leases SET heartbeat_at = now()
             WHERE shard_id = $1 AND owner_id = $2 AND generation = $3",
        )
        .bind(shard_id as i64)
        .bind(owner_id)
        .bind(generation as i64)
        .execute(&self.pool)
        .await
        .map_err(Self::map_sqlx_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, shard_id: u32, owner_id: &str, generation: u64) -> DesResult<()> {
        sqlx::query("DELETE FROM shard_leases WHERE shard_id = $1 AND owner_id = $2 AND generation = $3")
            .bind(shard_id as i64)
            .bind(owner_id)
            .bind(generation as i64)
            .execute(&self.pool)
            .await
            .map_err(Self::map_sqlx_err)?;
        Ok(())
    }

    async fn create_container(&self, record: &ContainerRecord) -> DesResult<()> {
        sqlx::query(
            "INSERT INTO containers
                (container_id, shard_id, day, bucket, key, state, file_count, byte_size,
                 created_at, committed_at, owner_id, generation)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (container_id) DO NOTHING",
        )
        .bind(&record.container_id)
        .bind(record.shard_id as i64)
        .bind(record.day)
        .bind(&record.bucket)
        .bind(&record.key)
        .bind(record.state.as_db_str())
        .bind(record.file_count as i64)
        .bind(record.byte_size as i64)
        .bind(record.created_at)
        .bind(record.committed_at)
        .bind(&record.owner_id)
        .bind(record.generation as i64)
        .execute(&self.pool)
        .await
        .map_err(Self::map_sqlx_err)?;
        Ok(())
    }

    async fn mark_uploaded(&self, container_id: &str, file_count: u64, byte_size: u64) -> DesResult<()> {
        sqlx::query(
            "UPDATE containers
             SET state = 'COMMITTED', committed_at = now(), file_count = $2, byte_size = $3
             WHERE container_id = $1 AND state IN ('OPEN', 'UPLOADING')",
        )
        .bind(container_id)
        .bind(file_count as i64)
        .bind(byte_size as i64)
        .execute(&self.pool)
        .await
        .map_err(Self::map_sqlx_err)?;
        Ok(())
    }

    async fn abandon(&self, container_id: &str) -> DesResult<()> {
        sqlx::query("UPDATE containers SET state = 'ABANDONED' WHERE container_id = $1 AND state != 'COMMITTED'")
            .bind(container_id)
            .execute(&self.pool)
            .await
            .map_err(Self::map_sqlx_err)?;
        Ok(())
    }

    async fn checkpoint(&self, container_id: &str, file_count: u64, byte_size: u64) -> DesResult<()> {
        sqlx::query("UPDATE containers SET file_count = $2, byte_size = $3 WHERE container_id = $1 AND state = 'OPEN'")
            .bind(container_id)
            .bind(file_count as i64)
            .bind(byte_size as i64)
            .execute(&self.pool)
            .await
            .map_err(Self::map_sqlx_err)?;
        Ok(())
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> DesResult<Vec<ShardLease>> {
        let rows = sqlx::query("SELECT shard_id, owner_id, heartbeat_at, ttl_seconds, generation FROM shard_leases")
            .fetch_all(&self.pool)
            .await
            .map_err(Self::map_sqlx_err)?;

        let mut out = Vec::new();
        for row in rows {
            let shard_id: i64 = row.try_get("shard_id").map_err(Self::map_sqlx_err)?;
            let owner_id: String = row.try_get("owner_id").map_err(Self::map_sqlx_err)?;
            let heartbeat_at: DateTime<Utc> = row.try_get("heartbeat_at").map_err(Self::map_sqlx_err)?;
            let ttl_seconds: i32 = row.try_get("ttl_seconds").map_err(Self::map_sqlx_err)?;
            let generation: i64 = row.try_get("generation").map_err(Self::map_sqlx_err)?;
            let lease = ShardLease {
                shard_id: shard_id as u32,
                owner_id,
                acquired_at: heartbeat_at,
                heartbeat_at,
                ttl_seconds: ttl_seconds as u32,
                generation: generation as u64,
            };
            if lease.is_expired_at(now) {
                out.push(lease);
            }
        }
        Ok(out)
    }

    async fn list_active_leases(&self, now: DateTime<Utc>) -> DesResult<Vec<ShardLease>> {
        let rows = sqlx::query("SELECT shard_id, owner_id, heartbeat_at, ttl_seconds, generation FROM shard_leases")
            .fetch_all(&self.pool)
            .await
            .map_err(Self::map_sqlx_err)?;

        let mut out = Vec::new();
        for row in rows {
            let shard_id: i64 = row.try_get("shard_id").map_err(Self::map_sqlx_err)?;
            let owner_id: String = row.try_get("owner_id").map_err(Self::map_sqlx_err)?;
            let heartbeat_at: DateTime<Utc> = row.try_get("heartbeat_at").map_err(Self::map_sqlx_err)?;
            let ttl_seconds: i32 = row.try_get("ttl_seconds").map_err(Self::map_sqlx_err)?;
            let generation: i64 = row.try_get("generation").map_err(Self::map_sqlx_err)?;
            let lease = ShardLease {
                shard_id: shard_id as u32,
                owner_id,
                acquired_at: heartbeat_at,
                heartbeat_at,
                ttl_seconds: ttl_seconds as u32,
                generation: generation as u64,
            };
            if !lease.is_expired_at(now) {
                out.push(lease);
            }
        }
        Ok(out)
    }

    async fn list_stale_containers(&self, age: Duration) -> DesResult<Vec<ContainerRecord>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::max_value());
        let rows = sqlx::query(
            "SELECT container_id, shard_id, day, bucket, key, state, file_count, byte_size,
                    created_at, committed_at, owner_id, generation
             FROM containers
             WHERE state != 'COMMITTED' AND created_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_sqlx_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let state_str: String = row.try_get("state").map_err(Self::map_sqlx_err)?;
            let shard_id: i64 = row.try_get("shard_id").map_err(Self::map_sqlx_err)?;
            let file_count: i64 = row.try_get("file_count").map_err(Self::map_sqlx_err)?;
            let byte_size: i64 = row.try_get("byte_size").map_err(Self::map_sqlx_err)?;
            let generation: i64 = row.try_get("generation").map_err(Self::map_sqlx_err)?;
            out.push(ContainerRecord {
                container_id: row.try_get("container_id").map_err(Self::map_sqlx_err)?,
                shard_id: shard_id as u32,
                day: row.try_get("day").map_err(Self::map_sqlx_err)?,
                bucket: row.try_get("bucket").map_err(Self::map_sqlx_err)?,
                key: row.try_get("key").map_err(Self::map_sqlx_err)?,
                state: ContainerState::from_db_str(&state_str)
                    .ok_or_else(|| DesError::CorruptContainer(format!("unknown container state {state_str:?}")))?,
                file_count: file_count as u64,
                byte_size: byte_size as u64,
                created_at: row.try_get("created_at").map_err(Self::map_sqlx_err)?,
                committed_at: row.try_get("committed_at").map_err(Self::map_sqlx_err)?,
                owner_id: row.try_get("owner_id").map_err(Self::map_sqlx_err)?,
                generation: generation as u64,
            });
        }
        Ok(out)
    }
}
