//! Runtime backend for `SourceProvider` — one connection per configured
//! source, tagged by dialect.
//!
//! Shard filtering happens client-side: `consistent_hash` depends on
//! SHA-256, which isn't portably expressible in one SQL dialect let alone
//! four, so `claim` pulls an oversampled batch of `pending` (plus
//! timed-out `claimed`) rows by status alone, computes each row's shard in
//! Rust, keeps the ones this provider's `shard_ids` owns, and immediately
//! releases (resets to `pending`) any claimed row that belongs to a shard
//! this worker doesn't own. A worker assigned few shards in a busy table
//! pays for this in extra claim/release round-trips, not in correctness.
//!
//! A row claimed longer than `claim_timeout_seconds` ago (per its
//! `claimed_at` column) is re-eligible for claim alongside plain `pending`
//! rows (spec §4.8) — the claim predicate below is `status = pending OR
//! (status = claimed AND claimed_at < now - timeout)` in every dialect.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde_json::Value;
use sqlx::{MySqlPool, PgPool, Row};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{DesError, DesResult};
use crate::shard::consistent_hash;

use super::{ColumnMapping, PendingFile, SourceConfig, SourceProvider};

type MssqlClient = tiberius::Client<tokio_util::compat::Compat<tokio::net::TcpStream>>;

pub enum SourceBackend {
    Postgres(PgPool),
    MySql(MySqlPool),
    Mssql(Arc<AsyncMutex<MssqlClient>>),
    #[cfg(feature = "oracle-dialect")]
    Oracle(Arc<std::sync::Mutex<oracle::Connection>>),
}

/// How many extra rows to pull per claim batch, to absorb the client-side
/// shard filter without starving a lightly-assigned worker.
const CLAIM_OVERSAMPLE: usize = 4;

pub struct SourceProviderImpl {
    backend: SourceBackend,
    config: SourceConfig,
    source_store: Arc<dyn ObjectStore>,
    owner_id: String,
}

impl SourceProviderImpl {
    pub fn new(backend: SourceBackend, config: SourceConfig, source_store: Arc<dyn ObjectStore>, owner_id: String) -> Self {
        Self {
            backend,
            config,
            source_store,
            owner_id,
        }
    }

    fn mapping(&self) -> &ColumnMapping {
        &self.config.mapping
    }

    fn row_shard_id(&self, key: &str, shard_key: Option<&str>) -> u32 {
        consistent_hash(shard_key.unwrap_or(key).as_bytes(), self.config.shard_bits)
    }

    /// `metadata_columns` (§3.5/§6.4), source-column-name-first so SQL
    /// generation and row extraction walk the same deterministic order —
    /// `HashMap` iteration order isn't stable enough for positional binds.
    fn metadata_columns_sorted(&self) -> Vec<(String, String)> {
        let mut cols: Vec<(String, String)> = self
            .config
            .metadata_columns
            .iter()
            .map(|(meta_key, col)| (meta_key.clone(), col.clone()))
            .collect();
        cols.sort_by(|a, b| a.0.cmp(&b.0));
        cols
    }

    fn claim_cutoff(&self) -> chrono::DateTime<Utc> {
        Utc::now() - chrono::Duration::seconds(self.config.claim_timeout_seconds as i64)
    }
}

#[async_trait]
impl SourceProvider for SourceProviderImpl {
    async fn claim(&self, batch_size: usize, shard_ids: &[u32]) -> DesResult<Vec<PendingFile>> {
        let limit = batch_size.saturating_mul(CLAIM_OVERSAMPLE).max(batch_size);
        let m = self.mapping();
        let table = self.config.qualified_table();
        let meta_cols = self.metadata_columns_sorted();
        let claim_cutoff = self.claim_cutoff();
        let now = Utc::now();

        let claimed = match &self.backend {
            SourceBackend::Postgres(pool) => {
                let mut tx = pool.begin().await.map_err(map_sqlx)?;
                let where_extra = self
                    .config
                    .where_clause
                    .as_ref()
                    .map(|w| format!(" AND ({w})"))
                    .unwrap_or_default();
                let meta_select: String = meta_cols.iter().map(|(_, c)| format!(", {c}")).collect();
                let sql = format!(
                    "WITH claimed AS (
                        SELECT {id} FROM {table}
                        WHERE ({status} = $1 OR ({status} = $2 AND {claimed_at} < $3)){where_extra}
                        ORDER BY {id}
                        FOR UPDATE SKIP LOCKED
                        LIMIT {limit}
                    )
                    UPDATE {table} SET {status} = $4, {claimed_at} = $5
                    WHERE {id} IN (SELECT {id} FROM claimed)
                    RETURNING {id}, {bucket}, {key}, {size_bytes}, {created_at}, {claimed_at}{shard_key_col}{meta_select}",
                    id = m.id,
                    status = m.status,
                    claimed_at = m.claimed_at,
                    bucket = m.bucket,
                    key = m.key,
                    size_bytes = m.size_bytes,
                    created_at = m.created_at,
                    shard_key_col = m.shard_key.as_ref().map(|c| format!(", {c}")).unwrap_or_default(),
                );
                let rows = sqlx::query(&sql)
                    .bind(&self.config.status_pending_value)
                    .bind(&self.config.status_claimed_value)
                    .bind(claim_cutoff)
                    .bind(&self.config.status_claimed_value)
                    .bind(now)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                tx.commit().await.map_err(map_sqlx)?;

                rows.into_iter()
                    .map(|row| self.row_to_pending(&row, m, &meta_cols))
                    .collect::<DesResult<Vec<_>>>()?
            }
            SourceBackend::MySql(pool) => {
                let mut tx = pool.begin().await.map_err(map_sqlx)?;
                let meta_select: String = meta_cols.iter().map(|(_, c)| format!(", {c}")).collect();
                let select_sql = format!(
                    "SELECT {id}, {bucket}, {key}, {size_bytes}, {created_at}, {claimed_at}{shard_key_col}{meta_select}
                     FROM {table}
                     WHERE ({status} = ? OR ({status} = ? AND {claimed_at} < ?))
                     ORDER BY {id} LIMIT {limit} FOR UPDATE SKIP LOCKED",
                    id = m.id,
                    status = m.status,
                    claimed_at = m.claimed_at,
                    bucket = m.bucket,
                    key = m.key,
                    size_bytes = m.size_bytes,
                    created_at = m.created_at,
                    shard_key_col = m.shard_key.as_ref().map(|c| format!(", {c}")).unwrap_or_default(),
                );
                let rows = sqlx::query(&select_sql)
                    .bind(&self.config.status_pending_value)
                    .bind(&self.config.status_claimed_value)
                    .bind(claim_cutoff)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                let ids: Vec<String> = rows
                    .iter()
                    .map(|r| r.try_get::<String, _>(m.id.as_str()).map_err(map_sqlx))
                    .collect::<DesResult<_>>()?;
                if !ids.is_empty() {
                    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                    let update_sql = format!(
                        "UPDATE {table} SET {status} = ?, {claimed_at} = ? WHERE {id} IN ({placeholders})",
                        status = m.status,
                        claimed_at = m.claimed_at,
                        id = m.id,
                        table = table
                    );
                    let mut q = sqlx::query(&update_sql).bind(&self.config.status_claimed_value).bind(now);
                    for id in &ids {
                        q = q.bind(id);
                    }
                    q.execute(&mut *tx).await.map_err(map_sqlx)?;
                }
                tx.commit().await.map_err(map_sqlx)?;

                rows.into_iter()
                    .map(|row| self.row_to_pending(&row, m, &meta_cols))
                    .collect::<DesResult<Vec<_>>>()?
            }
            SourceBackend::Mssql(client) => {
                let mut guard = client.lock().await;
                let meta_output: String = meta_cols.iter().map(|(_, c)| format!(", inserted.{c}")).collect();
                let sql = format!(
                    "UPDATE TOP ({limit}) {table} WITH (ROWLOCK, READPAST)
                     SET {status} = @P3, {claimed_at} = @P4
                     OUTPUT inserted.{id}, inserted.{bucket}, inserted.{key}, inserted.{size_bytes}, inserted.{created_at}, inserted.{claimed_at}{meta_output}
                     WHERE {status} = @P1 OR ({status} = @P3 AND {claimed_at} < @P2)",
                    id = m.id,
                    status = m.status,
                    claimed_at = m.claimed_at,
                    bucket = m.bucket,
                    key = m.key,
                    size_bytes = m.size_bytes,
                    created_at = m.created_at,
                );
                let claim_cutoff_naive = claim_cutoff.naive_utc();
                let now_naive = now.naive_utc();
                let stream = guard
                    .query(
                        &sql,
                        &[
                            &self.config.status_pending_value,
                            &claim_cutoff_naive,
                            &self.config.status_claimed_value,
                            &now_naive,
                        ],
                    )
                    .await
                    .map_err(|e| DesError::Transient(format!("mssql claim failed: {e}")))?;
                let result_rows = stream
                    .into_first_result()
                    .await
                    .map_err(|e| DesError::Transient(format!("mssql claim result failed: {e}")))?;

                let mut out = Vec::with_capacity(result_rows.len());
                for row in result_rows {
                    let id: &str = row.get(0).ok_or_else(|| DesError::CorruptContainer("missing id column".into()))?;
                    let bucket: &str = row.get(1).unwrap_or_default();
                    let key: &str = row.get(2).unwrap_or_default();
                    let size_bytes: i64 = row.get(3).unwrap_or_default();
                    let created_at: chrono::NaiveDateTime = row.get(4).unwrap_or_default();
                    let claimed_at: chrono::NaiveDateTime = row.get(5).unwrap_or_default();
                    let mut meta_map = serde_json::Map::new();
                    for (idx, (meta_key, _col)) in meta_cols.iter().enumerate() {
                        let v: Option<&str> = row.get(6 + idx);
                        meta_map.insert(meta_key.clone(), v.map(|s| Value::String(s.to_owned())).unwrap_or(Value::Null));
                    }
                    let metadata = if meta_map.is_empty() { Value::Null } else { Value::Object(meta_map) };
                    let shard_id = self.row_shard_id(key, None);
                    out.push(PendingFile {
                        id: id.to_owned(),
                        bucket: bucket.to_owned(),
                        key: key.to_owned(),
                        size_bytes: size_bytes as u64,
                        created_at: created_at.and_utc(),
                        shard_id,
                        owner_id: self.owner_id.clone(),
                        claimed_at: claimed_at.and_utc(),
                        metadata,
                    });
                }
                out
            }
            #[cfg(feature = "oracle-dialect")]
            SourceBackend::Oracle(conn) => {
                let conn = conn.clone();
                let config = self.config.clone();
                let owner_id = self.owner_id.clone();
                tokio::task::spawn_blocking(move || claim_oracle(&conn, &config, limit, &owner_id))
                    .await
                    .map_err(|e| DesError::Transient(format!("oracle claim task panicked: {e}")))??
            }
        };

        let filtered = self.apply_shard_filter(claimed, shard_ids).await?;
        Ok(filtered)
    }

    async fn fetch(&self, file: &PendingFile) -> DesResult<Bytes> {
        let path = ObjectPath::from(file.key.as_str());
        let result = self
            .source_store
            .get(&path)
            .await
            .map_err(|e| DesError::ExternalFetchFailed(format!("source fetch {} failed: {e}", file.key)))?;
        result
            .bytes()
            .await
            .map_err(|e| DesError::ExternalFetchFailed(format!("source body read {} failed: {e}", file.key)))
    }

    async fn mark_packed(&self, file: &PendingFile, container_id: &str) -> DesResult<()> {
        self.set_status(&file.id, &self.config.status_packed_value, Some(container_id)).await
    }

    async fn mark_failed(&self, file: &PendingFile, _reason: &str) -> DesResult<()> {
        self.set_status(&file.id, &self.config.status_failed_value, None).await
    }

    async fn list_claimed(&self) -> DesResult<Vec<PendingFile>> {
        let m = self.mapping();
        let table = self.config.qualified_table();
        let meta_cols = self.metadata_columns_sorted();

        match &self.backend {
            SourceBackend::Postgres(pool) => {
                let meta_select: String = meta_cols.iter().map(|(_, c)| format!(", {c}")).collect();
                let sql = format!(
                    "SELECT {id}, {bucket}, {key}, {size_bytes}, {created_at}, {claimed_at}{shard_key_col}{meta_select}
                     FROM {table} WHERE {status} = $1",
                    id = m.id,
                    status = m.status,
                    claimed_at = m.claimed_at,
                    bucket = m.bucket,
                    key = m.key,
                    size_bytes = m.size_bytes,
                    created_at = m.created_at,
                    shard_key_col = m.shard_key.as_ref().map(|c| format!(", {c}")).unwrap_or_default(),
                );
                let rows = sqlx::query(&sql)
                    .bind(&self.config.status_claimed_value)
                    .fetch_all(pool)
                    .await
                    .map_err(map_sqlx)?;
                rows.into_iter().map(|row| self.row_to_pending(&row, m, &meta_cols)).collect::<DesResult<Vec<_>>>()
            }
            SourceBackend::MySql(pool) => {
                let meta_select: String = meta_cols.iter().map(|(_, c)| format!(", {c}")).collect();
                let sql = format!(
                    "SELECT {id}, {bucket}, {key}, {size_bytes}, {created_at}, {claimed_at}{shard_key_col}{meta_select}
                     FROM {table} WHERE {status} = ?",
                    id = m.id,
                    status = m.status,
                    claimed_at = m.claimed_at,
                    bucket = m.bucket,
                    key = m.key,
                    size_bytes = m.size_bytes,
                    created_at = m.created_at,
                    shard_key_col = m.shard_key.as_ref().map(|c| format!(", {c}")).unwrap_or_default(),
                );
                let rows = sqlx::query(&sql)
                    .bind(&self.config.status_claimed_value)
                    .fetch_all(pool)
                    .await
                    .map_err(map_sqlx)?;
                rows.into_iter().map(|row| self.row_to_pending(&row, m, &meta_cols)).collect::<DesResult<Vec<_>>>()
            }
            SourceBackend::Mssql(client) => {
                let mut guard = client.lock().await;
                let meta_select: String = meta_cols.iter().map(|(_, c)| format!(", {c}")).collect();
                let sql = format!(
                    "SELECT {id}, {bucket}, {key}, {size_bytes}, {created_at}, {claimed_at}{meta_select} FROM {table} WHERE {status} = @P1",
                    id = m.id,
                    status = m.status,
                    claimed_at = m.claimed_at,
                    bucket = m.bucket,
                    key = m.key,
                    size_bytes = m.size_bytes,
                    created_at = m.created_at,
                );
                let stream = guard
                    .query(&sql, &[&self.config.status_claimed_value])
                    .await
                    .map_err(|e| DesError::Transient(format!("mssql list_claimed failed: {e}")))?;
                let result_rows = stream
                    .into_first_result()
                    .await
                    .map_err(|e| DesError::Transient(format!("mssql list_claimed result failed: {e}")))?;
                let mut out = Vec::with_capacity(result_rows.len());
                for row in result_rows {
                    let id: &str = row.get(0).ok_or_else(|| DesError::CorruptContainer("missing id column".into()))?;
                    let bucket: &str = row.get(1).unwrap_or_default();
                    let key: &str = row.get(2).unwrap_or_default();
                    let size_bytes: i64 = row.get(3).unwrap_or_default();
                    let created_at: chrono::NaiveDateTime = row.get(4).unwrap_or_default();
                    let claimed_at: chrono::NaiveDateTime = row.get(5).unwrap_or_default();
                    let mut meta_map = serde_json::Map::new();
                    for (idx, (meta_key, _col)) in meta_cols.iter().enumerate() {
                        let v: Option<&str> = row.get(6 + idx);
                        meta_map.insert(meta_key.clone(), v.map(|s| Value::String(s.to_owned())).unwrap_or(Value::Null));
                    }
                    let metadata = if meta_map.is_empty() { Value::Null } else { Value::Object(meta_map) };
                    let shard_id = self.row_shard_id(key, None);
                    out.push(PendingFile {
                        id: id.to_owned(),
                        bucket: bucket.to_owned(),
                        key: key.to_owned(),
                        size_bytes: size_bytes as u64,
                        created_at: created_at.and_utc(),
                        shard_id,
                        owner_id: self.owner_id.clone(),
                        claimed_at: claimed_at.and_utc(),
                        metadata,
                    });
                }
                Ok(out)
            }
            #[cfg(feature = "oracle-dialect")]
            SourceBackend::Oracle(conn) => {
                let conn = conn.clone();
                let config = self.config.clone();
                let owner_id = self.owner_id.clone();
                tokio::task::spawn_blocking(move || list_claimed_oracle(&conn, &config, &owner_id))
                    .await
                    .map_err(|e| DesError::Transient(format!("oracle list_claimed task panicked: {e}")))?
            }
        }
    }

    async fn reset_to_pending(&self, file: &PendingFile) -> DesResult<()> {
        self.set_status(&file.id, &self.config.status_pending_value, None).await
    }
}

impl SourceProviderImpl {
    /// Generic over `sqlx::Row` so the same column-extraction logic serves
    /// both the Postgres and MySQL claim/list_claimed paths without
    /// duplicating it. `meta_cols` is the same sorted `(meta_key, column)`
    /// list the caller used to build the SELECT, so indices line up.
    fn row_to_pending<'r, R>(&self, row: &'r R, m: &ColumnMapping, meta_cols: &[(String, String)]) -> DesResult<PendingFile>
    where
        R: Row,
        for<'c> &'c str: sqlx::ColumnIndex<R>,
        String: sqlx::Type<R::Database> + sqlx::Decode<'r, R::Database>,
        i64: sqlx::Type<R::Database> + sqlx::Decode<'r, R::Database>,
        chrono::DateTime<Utc>: sqlx::Type<R::Database> + sqlx::Decode<'r, R::Database>,
    {
        let id: String = row.try_get(m.id.as_str()).map_err(map_sqlx)?;
        let bucket: String = row.try_get(m.bucket.as_str()).map_err(map_sqlx)?;
        let key: String = row.try_get(m.key.as_str()).map_err(map_sqlx)?;
        let size_bytes: i64 = row.try_get(m.size_bytes.as_str()).map_err(map_sqlx)?;
        let created_at: chrono::DateTime<Utc> = row.try_get(m.created_at.as_str()).map_err(map_sqlx)?;
        let claimed_at: chrono::DateTime<Utc> = row.try_get(m.claimed_at.as_str()).map_err(map_sqlx)?;
        let shard_key: Option<String> = match &m.shard_key {
            Some(col) => row.try_get(col.as_str()).ok(),
            None => None,
        };
        let shard_id = self.row_shard_id(&key, shard_key.as_deref());

        let mut meta_map = serde_json::Map::new();
        for (meta_key, col) in meta_cols {
            let value: Option<String> = row.try_get(col.as_str()).ok();
            meta_map.insert(meta_key.clone(), value.map(Value::String).unwrap_or(Value::Null));
        }
        let metadata = if meta_map.is_empty() { Value::Null } else { Value::Object(meta_map) };

        Ok(PendingFile {
            id,
            bucket,
            key,
            size_bytes: size_bytes as u64,
            created_at,
            shard_id,
            owner_id: self.owner_id.clone(),
            claimed_at,
            metadata,
        })
    }

    /// Release (reset to pending) any claimed row whose derived shard isn't
    /// in `shard_ids` — see the module doc for why this happens client-side.
    async fn apply_shard_filter(&self, claimed: Vec<PendingFile>, shard_ids: &[u32]) -> DesResult<Vec<PendingFile>> {
        let (keep, release): (Vec<_>, Vec<_>) = claimed.into_iter().partition(|f| shard_ids.contains(&f.shard_id));
        for file in release {
            self.set_status(&file.id, &self.config.status_pending_value, None).await?;
        }
        Ok(keep)
    }

    async fn set_status(&self, id: &str, status_value: &str, container_id: Option<&str>) -> DesResult<()> {
        let m = self.mapping();
        let table = self.config.qualified_table();
        let _ = container_id; // packed rows don't carry the container id in v1's minimal mapping
        match &self.backend {
            SourceBackend::Postgres(pool) => {
                let sql = format!("UPDATE {table} SET {status} = $1 WHERE {id_col} = $2", status = m.status, id_col = m.id);
                sqlx::query(&sql).bind(status_value).bind(id).execute(pool).await.map_err(map_sqlx)?;
            }
            SourceBackend::MySql(pool) => {
                let sql = format!("UPDATE {table} SET {status} = ? WHERE {id_col} = ?", status = m.status, id_col = m.id);
                sqlx::query(&sql).bind(status_value).bind(id).execute(pool).await.map_err(map_sqlx)?;
            }
            SourceBackend::Mssql(client) => {
                let mut guard = client.lock().await;
                let sql = format!("UPDATE {table} SET {status} = @P1 WHERE {id_col} = @P2", status = m.status, id_col = m.id);
                guard
                    .execute(&sql, &[&status_value, &id])
                    .await
                    .map_err(|e| DesError::Transient(format!("mssql status update failed: {e}")))?;
            }
            #[cfg(feature = "oracle-dialect")]
            SourceBackend::Oracle(conn) => {
                let conn = conn.clone();
                let table = table.clone();
                let status_col = m.status.clone();
                let id_col = m.id.clone();
                let status_value = status_value.to_owned();
                let id = id.to_owned();
                tokio::task::spawn_blocking(move || -> DesResult<()> {
                    let guard = conn.lock().unwrap();
                    let sql = format!("UPDATE {table} SET {status_col} = :1 WHERE {id_col} = :2");
                    guard
                        .execute(&sql, &[&status_value, &id])
                        .map_err(|e| DesError::Transient(format!("oracle status update failed: {e}")))?;
                    guard
                        .commit()
                        .map_err(|e| DesError::Transient(format!("oracle commit failed: {e}")))?;
                    Ok(())
                })
                .await
                .map_err(|e| DesError::Transient(format!("oracle status task panicked: {e}")))??;
            }
        }
        Ok(())
    }
}

fn map_sqlx(e: sqlx::Error) -> DesError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => DesError::Transient(e.to_string()),
        sqlx::Error::Database(_) => DesError::Transient(e.to_string()),
        _ => DesError::Transient(e.to_string()),
    }
}

#[cfg(feature = "oracle-dialect")]
fn claim_oracle(
    conn: &std::sync::Mutex<oracle::Connection>,
    config: &SourceConfig,
    limit: usize,
    owner_id: &str,
) -> DesResult<Vec<PendingFile>> {
    let guard = conn.lock().unwrap();
    let m = &config.mapping;
    let table = config.qualified_table();
    let mut meta_cols: Vec<(String, String)> = config
        .metadata_columns
        .iter()
        .map(|(meta_key, col)| (meta_key.clone(), col.clone()))
        .collect();
    meta_cols.sort_by(|a, b| a.0.cmp(&b.0));
    let meta_select: String = meta_cols.iter().map(|(_, c)| format!(", {c}")).collect();
    let now = Utc::now();
    let claim_cutoff = (now - chrono::Duration::seconds(config.claim_timeout_seconds as i64)).naive_utc();

    let select_sql = format!(
        "SELECT {id}, {bucket}, {key}, {size_bytes}, {created_at}, {claimed_at}{meta_select} FROM {table}
         WHERE ({status} = :pending OR ({status} = :claimed_tag AND {claimed_at} < :cutoff))
         FETCH FIRST {limit} ROWS ONLY FOR UPDATE SKIP LOCKED",
        id = m.id,
        bucket = m.bucket,
        key = m.key,
        size_bytes = m.size_bytes,
        created_at = m.created_at,
        claimed_at = m.claimed_at,
        status = m.status,
    );
    let rows = guard
        .query(
            &select_sql,
            &[&config.status_pending_value, &config.status_claimed_value, &claim_cutoff],
        )
        .map_err(|e| DesError::Transient(format!("oracle claim select failed: {e}")))?;

    let mut out = Vec::new();
    let mut ids = Vec::new();
    for row_result in rows {
        let row = row_result.map_err(|e| DesError::Transient(e.to_string()))?;
        let id: String = row.get(0).map_err(|e| DesError::Transient(e.to_string()))?;
        let bucket: String = row.get(1).unwrap_or_default();
        let key: String = row.get(2).unwrap_or_default();
        let size_bytes: i64 = row.get(3).unwrap_or_default();
        let created_at: chrono::NaiveDateTime = row.get(4).unwrap_or_default();
        let mut meta_map = serde_json::Map::new();
        for (idx, (meta_key, _col)) in meta_cols.iter().enumerate() {
            let v: Option<String> = row.get(6 + idx).ok();
            meta_map.insert(meta_key.clone(), v.map(Value::String).unwrap_or(Value::Null));
        }
        let metadata = if meta_map.is_empty() { Value::Null } else { Value::Object(meta_map) };
        ids.push(id.clone());
        out.push(PendingFile {
            id,
            bucket,
            key,
            size_bytes: size_bytes as u64,
            created_at: created_at.and_utc(),
            shard_id: 0, // filled in by the caller's client-side shard filter
            owner_id: owner_id.to_owned(),
            claimed_at: now,
            metadata,
        });
    }
    if !ids.is_empty() {
        let placeholders = (1..=ids.len()).map(|i| format!(":{}", i + 2)).collect::<Vec<_>>().join(",");
        let update_sql = format!(
            "UPDATE {table} SET {status} = :1, {claimed_at} = :2 WHERE {id_col} IN ({placeholders})",
            status = m.status,
            claimed_at = m.claimed_at,
            id_col = m.id
        );
        let mut binds: Vec<&dyn oracle::sql_type::ToSql> = vec![&config.status_claimed_value, &now];
        for id in &ids {
            binds.push(id);
        }
        guard
            .execute(&update_sql, &binds)
            .map_err(|e| DesError::Transient(format!("oracle claim update failed: {e}")))?;
        guard.commit().map_err(|e| DesError::Transient(format!("oracle commit failed: {e}")))?;
    }
    Ok(out)
}

#[cfg(feature = "oracle-dialect")]
fn list_claimed_oracle(
    conn: &std::sync::Mutex<oracle::Connection>,
    config: &SourceConfig,
    owner_id: &str,
) -> DesResult<Vec<PendingFile>> {
    let guard = conn.lock().unwrap();
    let m = &config.mapping;
    let table = config.qualified_table();
    let mut meta_cols: Vec<(String, String)> = config
        .metadata_columns
        .iter()
        .map(|(meta_key, col)| (meta_key.clone(), col.clone()))
        .collect();
    meta_cols.sort_by(|a, b| a.0.cmp(&b.0));
    let meta_select: String = meta_cols.iter().map(|(_, c)| format!(", {c}")).collect();

    let select_sql = format!(
        "SELECT {id}, {bucket}, {key}, {size_bytes}, {created_at}, {claimed_at}{meta_select} FROM {table} WHERE {status} = :claimed",
        id = m.id,
        bucket = m.bucket,
        key = m.key,
        size_bytes = m.size_bytes,
        created_at = m.created_at,
        claimed_at = m.claimed_at,
        status = m.status,
    );
    let rows = guard
        .query(&select_sql, &[&config.status_claimed_value])
        .map_err(|e| DesError::Transient(format!("oracle list_claimed select failed: {e}")))?;

    let mut out = Vec::new();
    for row_result in rows {
        let row = row_result.map_err(|e| DesError::Transient(e.to_string()))?;
        let id: String = row.get(0).map_err(|e| DesError::Transient(e.to_string()))?;
        let bucket: String = row.get(1).unwrap_or_default();
        let key: String = row.get(2).unwrap_or_default();
        let size_bytes: i64 = row.get(3).unwrap_or_default();
        let created_at: chrono::NaiveDateTime = row.get(4).unwrap_or_default();
        let claimed_at: chrono::NaiveDateTime = row.get(5).unwrap_or_default();
        let mut meta_map = serde_json::Map::new();
        for (idx, (meta_key, _col)) in meta_cols.iter().enumerate() {
            let v: Option<String> = row.get(6 + idx).ok();
            meta_map.insert(meta_key.clone(), v.map(Value::String).unwrap_or(Value::Null));
        }
        let metadata = if meta_map.is_empty() { Value::Null } else { Value::Object(meta_map) };
        let shard_id = consistent_hash(key.as_bytes(), config.shard_bits);
        out.push(PendingFile {
            id,
            bucket,
            key,
            size_bytes: size_bytes as u64,
            created_at: created_at.and_utc(),
            shard_id,
            owner_id: owner_id.to_owned(),
            claimed_at: claimed_at.and_utc(),
            metadata,
        });
    }
    Ok(out)
}
