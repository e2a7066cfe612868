//! Crash recovery — §4.10. Runs on packer startup and periodically
//! thereafter; reconciles the three pieces of state a crash can leave
//! inconsistent: shard leases, container records, and claimed source rows.
//!
//! Each of the three steps below is independent and order matters only in
//! that releasing expired leases first means step 3 never mistakes a lease
//! that's about to be reclaimed for a live one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;

use crate::error::{DesError, DesResult};
use crate::metadata_store::{ContainerState, MetadataStore};
use crate::metrics::MetricsSink;
use crate::reader::parse_trailing_footer;
use crate::source::SourceProvider;

pub struct CrashRecoveryConfig {
    /// A non-`COMMITTED` container record is only a salvage/abandon
    /// candidate once it's older than this — a container a shard task is
    /// actively writing to is not "orphaned" just because it's still open.
    pub stale_container_age: Duration,
}

impl Default for CrashRecoveryConfig {
    fn default() -> Self {
        Self {
            stale_container_age: Duration::from_secs(600),
        }
    }
}

/// What one `sweep_once` call actually did, for logging/metrics — crash
/// recovery runs unattended, so its own actions need to be observable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub leases_released: u32,
    pub containers_salvaged: u32,
    pub containers_abandoned: u32,
    pub claims_reset: u32,
}

pub struct CrashRecovery {
    metadata_store: Arc<dyn MetadataStore>,
    provider: Arc<dyn SourceProvider>,
    archive_store: Arc<dyn ObjectStore>,
    config: CrashRecoveryConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl CrashRecovery {
    pub fn new(
        metadata_store: Arc<dyn MetadataStore>,
        provider: Arc<dyn SourceProvider>,
        archive_store: Arc<dyn ObjectStore>,
        config: CrashRecoveryConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            metadata_store,
            provider,
            archive_store,
            config,
            metrics,
        }
    }

    /// One pass of all three reconciliation steps, in the order spec.md
    /// §4.10 lists them.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> DesResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        report.leases_released = self.release_expired_leases(now).await?;
        let (salvaged, abandoned) = self.reconcile_stale_containers(now).await?;
        report.containers_salvaged = salvaged;
        report.containers_abandoned = abandoned;
        report.claims_reset = self.reset_orphaned_claims(now).await?;

        self.metrics.on_event("recovery.leases_released", &[], report.leases_released as f64);
        self.metrics.on_event("recovery.containers_salvaged", &[], report.containers_salvaged as f64);
        self.metrics.on_event("recovery.containers_abandoned", &[], report.containers_abandoned as f64);
        self.metrics.on_event("recovery.claims_reset", &[], report.claims_reset as f64);
        tracing::info!(
            target: "des_store::recovery",
            leases_released = report.leases_released,
            containers_salvaged = report.containers_salvaged,
            containers_abandoned = report.containers_abandoned,
            claims_reset = report.claims_reset,
            "crash recovery sweep complete"
        );

        Ok(report)
    }

    /// Step 1: release leases whose `heartbeat_at + ttl < now`.
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> DesResult<u32> {
        let expired = self.metadata_store.list_expired_leases(now).await?;
        let mut released = 0;
        for lease in &expired {
            self.metadata_store.release(lease.shard_id, &lease.owner_id, lease.generation).await?;
            released += 1;
        }
        Ok(released)
    }

    /// Step 2: for each non-`COMMITTED` container older than `stale_age`,
    /// attempt a trailing-range footer read against the archive bucket.
    async fn reconcile_stale_containers(&self, _now: DateTime<Utc>) -> DesResult<(u32, u32)> {
        let stale = self.metadata_store.list_stale_containers(self.config.stale_container_age).await?;
        let mut salvaged = 0;
        let mut abandoned = 0;

        for record in stale {
            if record.state == ContainerState::Committed {
                continue;
            }
            match self.validate_footer(&record.key).await {
                Ok(footer_summary) => {
                    self.metadata_store
                        .mark_uploaded(&record.container_id, footer_summary.file_count, footer_summary.byte_size)
                        .await?;
                    salvaged += 1;
                }
                Err(_) => {
                    self.metadata_store.abandon(&record.container_id).await?;
                    let _ = self.archive_store.delete(&ObjectPath::from(record.key.as_str())).await;
                    abandoned += 1;
                }
            }
        }
        Ok((salvaged, abandoned))
    }

    /// Step 3: any source row still `claimed` whose shard holds no active
    /// lease is reset to `pending`. Our source schema has no per-row
    /// container-id column (see `SourceProviderImpl::set_status`), so "no
    /// COMMITTED container referencing it" collapses to "no live owner" —
    /// a packed row is never left `claimed`, it's always advanced to
    /// `status_packed_value` by `mark_packed` before the lease is released.
    async fn reset_orphaned_claims(&self, now: DateTime<Utc>) -> DesResult<u32> {
        let active: HashSet<u32> = self
            .metadata_store
            .list_active_leases(now)
            .await?
            .into_iter()
            .map(|l| l.shard_id)
            .collect();

        let claimed = self.provider.list_claimed().await?;
        let mut reset = 0;
        for file in claimed {
            if !active.contains(&file.shard_id) {
                self.provider.reset_to_pending(&file).await?;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn validate_footer(&self, key: &str) -> DesResult<FooterSummary> {
        let path = ObjectPath::from(key);
        let head = self
            .archive_store
            .head(&path)
            .await
            .map_err(|e| DesError::ExternalFetchFailed(format!("HEAD {key} failed: {e}")))?;
        let object_size = head.size as u64;
        if object_size < crate::format::FOOTER_SIZE as u64 {
            return Err(DesError::CorruptContainer("object smaller than FOOTER_SIZE".into()));
        }
        let tail = self
            .archive_store
            .get_range(&path, (object_size - crate::format::FOOTER_SIZE as u64) as usize..object_size as usize)
            .await
            .map_err(|e| DesError::ExternalFetchFailed(format!("range GET on {key} failed: {e}")))?;
        let footer = parse_trailing_footer(&tail, object_size)?;
        Ok(FooterSummary {
            file_count: footer.file_count,
            byte_size: object_size,
        })
    }
}

struct FooterSummary {
    file_count: u64,
    byte_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::{ContainerRecord, ShardLease};
    use crate::metrics::NullMetricsSink;
    use crate::source::PendingFile;
    use crate::writer::{ContainerWriter, WriteOptions};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::NaiveDate;
    use object_store::memory::InMemory;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeStore {
        leases: StdMutex<Vec<ShardLease>>,
        containers: StdMutex<Vec<ContainerRecord>>,
        released: StdMutex<Vec<(u32, String, u64)>>,
    }

    #[async_trait]
    impl MetadataStore for FakeStore {
        async fn try_acquire(&self, _shard_id: u32, _owner_id: &str, _ttl: Duration) -> DesResult<Option<ShardLease>> {
            unimplemented!()
        }
        async fn renew(&self, _shard_id: u32, _owner_id: &str, _generation: u64) -> DesResult<bool> {
            unimplemented!()
        }
        async fn release(&self, shard_id: u32, owner_id: &str, generation: u64) -> DesResult<()> {
            self.released.lock().unwrap().push((shard_id, owner_id.to_owned(), generation));
            self.leases.lock().unwrap().retain(|l| l.shard_id != shard_id);
            Ok(())
        }
        async fn create_container(&self, _record: &ContainerRecord) -> DesResult<()> {
            unimplemented!()
        }
        async fn mark_uploaded(&self, container_id: &str, file_count: u64, byte_size: u64) -> DesResult<()> {
            let mut containers = self.containers.lock().unwrap();
            if let Some(c) = containers.iter_mut().find(|c| c.container_id == container_id) {
                c.state = ContainerState::Committed;
                c.file_count = file_count;
                c.byte_size = byte_size;
            }
            Ok(())
        }
        async fn abandon(&self, container_id: &str) -> DesResult<()> {
            let mut containers = self.containers.lock().unwrap();
            if let Some(c) = containers.iter_mut().find(|c| c.container_id == container_id) {
                c.state = ContainerState::Abandoned;
            }
            Ok(())
        }
        async fn checkpoint(&self, _container_id: &str, _file_count: u64, _byte_size: u64) -> DesResult<()> {
            unimplemented!()
        }
        async fn list_expired_leases(&self, now: DateTime<Utc>) -> DesResult<Vec<ShardLease>> {
            Ok(self.leases.lock().unwrap().iter().filter(|l| l.is_expired_at(now)).cloned().collect())
        }
        async fn list_active_leases(&self, now: DateTime<Utc>) -> DesResult<Vec<ShardLease>> {
            Ok(self.leases.lock().unwrap().iter().filter(|l| !l.is_expired_at(now)).cloned().collect())
        }
        async fn list_stale_containers(&self, _age: Duration) -> DesResult<Vec<ContainerRecord>> {
            Ok(self.containers.lock().unwrap().iter().filter(|c| c.state != ContainerState::Committed).cloned().collect())
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        claimed: StdMutex<Vec<PendingFile>>,
        reset: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl SourceProvider for FakeProvider {
        async fn claim(&self, _batch_size: usize, _shard_ids: &[u32]) -> DesResult<Vec<PendingFile>> {
            unimplemented!()
        }
        async fn fetch(&self, _file: &PendingFile) -> DesResult<Bytes> {
            unimplemented!()
        }
        async fn mark_packed(&self, _file: &PendingFile, _container_id: &str) -> DesResult<()> {
            unimplemented!()
        }
        async fn mark_failed(&self, _file: &PendingFile, _reason: &str) -> DesResult<()> {
            unimplemented!()
        }
        async fn list_claimed(&self) -> DesResult<Vec<PendingFile>> {
            Ok(self.claimed.lock().unwrap().clone())
        }
        async fn reset_to_pending(&self, file: &PendingFile) -> DesResult<()> {
            self.reset.lock().unwrap().push(file.id.clone());
            self.claimed.lock().unwrap().retain(|f| f.id != file.id);
            Ok(())
        }
    }

    fn pending(id: &str, shard_id: u32) -> PendingFile {
        PendingFile {
            id: id.into(),
            bucket: "b".into(),
            key: format!("k/{id}"),
            size_bytes: 10,
            created_at: Utc::now(),
            shard_id,
            owner_id: "owner-a".into(),
            claimed_at: Utc::now(),
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn releases_only_expired_leases() {
        let now = Utc::now();
        let store = Arc::new(FakeStore::default());
        store.leases.lock().unwrap().push(ShardLease {
            shard_id: 1,
            owner_id: "owner-a".into(),
            acquired_at: now - chrono::Duration::seconds(100),
            heartbeat_at: now - chrono::Duration::seconds(100),
            ttl_seconds: 10,
            generation: 1,
        });
        store.leases.lock().unwrap().push(ShardLease {
            shard_id: 2,
            owner_id: "owner-b".into(),
            acquired_at: now,
            heartbeat_at: now,
            ttl_seconds: 60,
            generation: 1,
        });

        let provider = Arc::new(FakeProvider::default());
        let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let recovery = CrashRecovery::new(
            store.clone(),
            provider,
            archive,
            CrashRecoveryConfig::default(),
            Arc::new(NullMetricsSink),
        );

        let report = recovery.sweep_once(now).await.unwrap();
        assert_eq!(report.leases_released, 1);
        assert_eq!(store.released.lock().unwrap()[0].0, 1);
        assert_eq!(store.leases.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn salvages_container_with_valid_footer_and_abandons_without() {
        let now = Utc::now();
        let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

        let mut good_bytes = Vec::new();
        {
            let mut w = ContainerWriter::new(&mut good_bytes, "good-ctr".into(), WriteOptions::default(), None).unwrap();
            w.add("a.txt", b"hello", &json!({})).await.unwrap();
            w.finalize().unwrap();
        }
        archive.put(&ObjectPath::from("good.des"), good_bytes.into()).await.unwrap();
        archive.put(&ObjectPath::from("bad.des"), vec![0u8; 4].into()).await.unwrap();

        let store = Arc::new(FakeStore::default());
        store.containers.lock().unwrap().push(ContainerRecord {
            container_id: "good-ctr".into(),
            shard_id: 0,
            day: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            bucket: "archive".into(),
            key: "good.des".into(),
            state: ContainerState::Uploading,
            file_count: 0,
            byte_size: 0,
            created_at: now - chrono::Duration::seconds(1000),
            committed_at: None,
            owner_id: "owner-a".into(),
            generation: 1,
        });
        store.containers.lock().unwrap().push(ContainerRecord {
            container_id: "bad-ctr".into(),
            shard_id: 0,
            day: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            bucket: "archive".into(),
            key: "bad.des".into(),
            state: ContainerState::Open,
            file_count: 0,
            byte_size: 0,
            created_at: now - chrono::Duration::seconds(1000),
            committed_at: None,
            owner_id: "owner-a".into(),
            generation: 1,
        });

        let provider = Arc::new(FakeProvider::default());
        let recovery = CrashRecovery::new(
            store.clone(),
            provider,
            archive.clone(),
            CrashRecoveryConfig::default(),
            Arc::new(NullMetricsSink),
        );

        let report = recovery.sweep_once(now).await.unwrap();
        assert_eq!(report.containers_salvaged, 1);
        assert_eq!(report.containers_abandoned, 1);

        let containers = store.containers.lock().unwrap();
        let good = containers.iter().find(|c| c.container_id == "good-ctr").unwrap();
        assert_eq!(good.state, ContainerState::Committed);
        let bad = containers.iter().find(|c| c.container_id == "bad-ctr").unwrap();
        assert_eq!(bad.state, ContainerState::Abandoned);
        assert!(archive.head(&ObjectPath::from("bad.des")).await.is_err());
    }

    #[tokio::test]
    async fn resets_claims_whose_shard_has_no_active_lease() {
        let now = Utc::now();
        let store = Arc::new(FakeStore::default());
        store.leases.lock().unwrap().push(ShardLease {
            shard_id: 1,
            owner_id: "owner-a".into(),
            acquired_at: now,
            heartbeat_at: now,
            ttl_seconds: 60,
            generation: 1,
        });

        let provider = Arc::new(FakeProvider::default());
        provider.claimed.lock().unwrap().push(pending("f1", 1)); // shard has live lease
        provider.claimed.lock().unwrap().push(pending("f2", 2)); // shard has no lease

        let archive: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let recovery = CrashRecovery::new(store, provider.clone(), archive, CrashRecoveryConfig::default(), Arc::new(NullMetricsSink));

        let report = recovery.sweep_once(now).await.unwrap();
        assert_eq!(report.claims_reset, 1);
        assert_eq!(provider.reset.lock().unwrap(), &["f2".to_string()]);
        assert_eq!(provider.claimed.lock().unwrap().len(), 1);
    }
}
