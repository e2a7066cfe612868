//! Multi-shard packer — §4.9, the control loop at the heart of the system.

pub mod backpressure;
pub mod retry;
pub mod state;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::blob::ExternalBlobStore;
use crate::error::{DesError, DesResult};
use crate::metadata_store::{ContainerRecord, ContainerState, MetadataStore};
use crate::metrics::{MetricsSink, NullMetricsSink, ReadinessProbe};
use crate::naming::NameGenerator;
use crate::source::{PendingFile, SourceProvider};
use crate::writer::{ContainerWriter, WriteOptions};

pub use backpressure::BatchSizer;
pub use retry::{with_retry, RetryPolicy};
pub use state::ShardPhase;

#[derive(Debug, Clone)]
pub struct PackerConfig {
    pub workdir: PathBuf,
    pub archive_bucket: String,
    pub shard_bits: u32,
    pub max_container_bytes: u64,
    pub max_files_per_container: u64,
    pub checkpoint_interval_files: u64,
    pub checkpoint_interval_bytes: u64,
    pub lease_ttl: Duration,
    pub shutdown_grace: Duration,
    pub min_commit_files: u64,
    pub initial_batch_size: usize,
    pub max_batch_size: usize,
    pub write_options: WriteOptions,
    pub retry_policy: RetryPolicy,
    pub idle_poll_interval: Duration,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("./workdir"),
            archive_bucket: "archive".into(),
            shard_bits: 8,
            max_container_bytes: 512 * 1024 * 1024,
            max_files_per_container: 1_000_000,
            checkpoint_interval_files: 1_000,
            checkpoint_interval_bytes: 64 * 1024 * 1024,
            lease_ttl: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            min_commit_files: 1,
            initial_batch_size: 16,
            max_batch_size: 512,
            write_options: WriteOptions::default(),
            retry_policy: RetryPolicy::default(),
            idle_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Zero-padded hex shard component of the archive key, per §6.2:
/// `ceil(shard_bits/4)` hex digits.
fn shard_hex(shard_id: u32, shard_bits: u32) -> String {
    let width = (shard_bits as usize + 3) / 4;
    format!("{shard_id:0width$x}", width = width.max(1))
}

struct OpenContainer {
    writer: ContainerWriter<std::fs::File>,
    container_id: String,
    archive_key: String,
    tmp_path: PathBuf,
    day: NaiveDate,
    claims: Vec<PendingFile>,
}

/// Owns the shared collaborators for every shard task; `run` fans one task
/// out per assigned shard. All fields are `Arc`-backed so a shard task can
/// hold its own clone independently.
#[derive(Clone)]
pub struct Packer {
    owner_id: String,
    metadata_store: Arc<dyn MetadataStore>,
    provider: Arc<dyn SourceProvider>,
    archive_store: Arc<dyn ObjectStore>,
    blob_store: Option<Arc<dyn ExternalBlobStore>>,
    name_generator: Arc<AsyncMutex<NameGenerator>>,
    config: Arc<PackerConfig>,
    metrics: Arc<dyn MetricsSink>,
    readiness: Arc<ReadinessProbe>,
}

impl Packer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner_id: String,
        metadata_store: Arc<dyn MetadataStore>,
        provider: Arc<dyn SourceProvider>,
        archive_store: Arc<dyn ObjectStore>,
        blob_store: Option<Arc<dyn ExternalBlobStore>>,
        name_generator: NameGenerator,
        config: PackerConfig,
    ) -> Self {
        Self {
            owner_id,
            metadata_store,
            provider,
            archive_store,
            blob_store,
            name_generator: Arc::new(AsyncMutex::new(name_generator)),
            config: Arc::new(config),
            metrics: Arc::new(NullMetricsSink),
            readiness: ReadinessProbe::new(Duration::from_secs(120)),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn readiness(&self) -> Arc<ReadinessProbe> {
        self.readiness.clone()
    }

    /// `Packer::run(shard_assignment, shutdown_signal)` — the public
    /// surface from §6.5. Spawns one task per assigned shard and waits for
    /// all of them to reach a terminal state (normally: shutdown observed).
    pub async fn run(self: Arc<Self>, shard_assignment: Vec<u32>, shutdown: watch::Receiver<bool>) -> DesResult<()> {
        let mut handles = Vec::with_capacity(shard_assignment.len());
        for shard_id in shard_assignment {
            let packer = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { packer.run_shard(shard_id, shutdown).await }));
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| DesError::Transient(format!("shard task panicked: {e}")))??;
        }
        Ok(())
    }

    /// IDLE -> LEASED -> PACKING -> (FINALIZING ->)* -> IDLE, forever, until
    /// shutdown is observed while idle.
    async fn run_shard(&self, shard_id: u32, mut shutdown: watch::Receiver<bool>) -> DesResult<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let lease = match self.metadata_store.try_acquire(shard_id, &self.owner_id, self.config.lease_ttl).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    tokio::time::sleep(self.config.idle_poll_interval).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(shard_id, error = %e, "try_acquire failed");
                    tokio::time::sleep(self.config.idle_poll_interval).await;
                    continue;
                }
            };
            self.metrics.on_event("des.shard.leased", &[("shard_id", &shard_id.to_string())], 1.0);

            let lost = Arc::new(AtomicBool::new(false));
            let heartbeat_handle = self.spawn_heartbeat(shard_id, lease.generation, lost.clone());

            let outcome = self.pack_shard(shard_id, lease.generation, lost.clone(), shutdown.clone()).await;
            heartbeat_handle.abort();

            match outcome {
                Ok(()) => {
                    let _ = self.metadata_store.release(shard_id, &self.owner_id, lease.generation).await;
                }
                Err(e) => {
                    tracing::warn!(shard_id, error = %e, "shard task exited with error; releasing lease");
                    let _ = self.metadata_store.release(shard_id, &self.owner_id, lease.generation).await;
                }
            }

            if *shutdown.borrow() {
                return Ok(());
            }
            // Loop back to try_acquire immediately — the LOST/FAILED ->
            // IDLE edge in the state diagram above.
        }
    }

    fn spawn_heartbeat(&self, shard_id: u32, generation: u64, lost: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.lease_ttl / 3;
        let store = self.metadata_store.clone();
        let owner_id = self.owner_id.clone();
        let readiness = self.readiness.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match store.renew(shard_id, &owner_id, generation).await {
                    Ok(true) => readiness.record_lease_renew(),
                    Ok(false) => {
                        lost.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(_) => {
                        // Transient renew failures don't immediately declare
                        // the lease lost; only an explicit "no longer held"
                        // answer does. The next tick tries again.
                    }
                }
            }
        })
    }

    /// The PACKING loop for one held lease. Returns `Err(LeaseLost)` if the
    /// heartbeat task observes the lease was lost underneath us.
    async fn pack_shard(&self, shard_id: u32, generation: u64, lost: Arc<AtomicBool>, mut shutdown: watch::Receiver<bool>) -> DesResult<()> {
        let mut sizer = BatchSizer::new(self.config.initial_batch_size, self.config.max_batch_size);
        let mut open: Option<OpenContainer> = None;
        let mut files_since_checkpoint = 0u64;
        let mut bytes_since_checkpoint = 0u64;

        loop {
            if lost.load(Ordering::SeqCst) {
                if let Some(container) = open.take() {
                    self.abort_container(container).await;
                }
                return Err(DesError::LeaseLost {
                    shard_id,
                    owner_id: self.owner_id.clone(),
                });
            }

            let shutting_down = *shutdown.borrow();
            if shutting_down {
                if let Some(container) = open.take() {
                    self.finalize_on_shutdown(container).await?;
                }
                return Ok(());
            }

            if open.is_none() {
                open = Some(self.open_container(shard_id, generation).await?);
            }
            let day_now = Utc::now().date_naive();
            if open.as_ref().unwrap().day != day_now {
                let container = open.take().unwrap();
                self.finalize_and_commit(container).await?;
                continue;
            }

            let batch_size = sizer.current();
            match self.provider.claim(batch_size, &[shard_id]).await {
                Ok(files) if files.is_empty() => {
                    tokio::time::sleep(self.config.idle_poll_interval).await;
                }
                Ok(files) => {
                    let mut any_failed = false;
                    let container = open.as_mut().unwrap();
                    for file in files {
                        match self.ingest_one(&mut container.writer, &file).await {
                            Ok(len) => {
                                container.claims.push(file);
                                files_since_checkpoint += 1;
                                bytes_since_checkpoint += len;
                            }
                            Err(e) => {
                                any_failed = true;
                                let _ = self.provider.mark_failed(&file, &e.to_string()).await;
                            }
                        }
                    }
                    if any_failed {
                        sizer.on_error();
                    } else {
                        sizer.on_success();
                    }

                    if files_since_checkpoint >= self.config.checkpoint_interval_files
                        || bytes_since_checkpoint >= self.config.checkpoint_interval_bytes
                    {
                        self.metadata_store
                            .checkpoint(&container.container_id, container.writer.file_count() as u64, container.writer.bytes_buffered())
                            .await?;
                        files_since_checkpoint = 0;
                        bytes_since_checkpoint = 0;
                    }

                    if container.writer.bytes_buffered() >= self.config.max_container_bytes
                        || container.writer.file_count() as u64 >= self.config.max_files_per_container
                    {
                        let container = open.take().unwrap();
                        self.finalize_and_commit(container).await?;
                    }
                }
                Err(e) => {
                    sizer.on_error();
                    tracing::warn!(shard_id, error = %e, "claim failed");
                    tokio::time::sleep(self.config.idle_poll_interval).await;
                }
            }
        }
    }

    async fn ingest_one(&self, writer: &mut ContainerWriter<std::fs::File>, file: &PendingFile) -> DesResult<u64> {
        let bytes = self.provider.fetch(file).await?;
        writer.add(file.container_entry_name(), &bytes, &file.metadata).await?;
        Ok(bytes.len() as u64)
    }

    async fn open_container(&self, shard_id: u32, generation: u64) -> DesResult<OpenContainer> {
        let day = Utc::now().date_naive();
        let container_id = {
            let mut generator = self.name_generator.lock().await;
            generator.next(Utc::now())?
        };
        std::fs::create_dir_all(&self.config.workdir)?;
        let tmp_path = self.config.workdir.join(format!("{shard_id}-{day}-{container_id}.des.tmp"));

        let writer = ContainerWriter::open(
            &tmp_path,
            container_id.clone(),
            self.config.write_options.clone(),
            self.blob_store.clone(),
        )?;

        let archive_key = archive_key(&day, shard_id, self.config.shard_bits, &container_id);
        let record = ContainerRecord {
            container_id: container_id.clone(),
            shard_id,
            day,
            bucket: self.config.archive_bucket.clone(),
            key: archive_key.clone(),
            state: ContainerState::Open,
            file_count: 0,
            byte_size: 0,
            created_at: Utc::now(),
            committed_at: None,
            owner_id: self.owner_id.clone(),
            generation,
        };
        self.metadata_store.create_container(&record).await?;

        Ok(OpenContainer {
            writer,
            container_id,
            archive_key,
            tmp_path,
            day,
            claims: Vec::new(),
        })
    }

    /// Finalize, upload to the archive bucket, commit the container record,
    /// and mark every claim in this container `packed` — in that order, so
    /// a crash between any two steps always leaves recovery (§4.10) with
    /// exactly one reconciling action to take.
    async fn finalize_and_commit(&self, container: OpenContainer) -> DesResult<()> {
        let OpenContainer {
            writer,
            container_id,
            archive_key,
            tmp_path,
            claims,
            ..
        } = container;

        let stats = writer.finalize()?;
        let bytes = tokio::fs::read(&tmp_path).await?;
        let key = ObjectPath::from(archive_key);
        with_retry(&self.config.retry_policy, || {
            let key = key.clone();
            let bytes = bytes.clone();
            async move {
                self.archive_store
                    .put(&key, bytes.into())
                    .await
                    .map_err(|e| DesError::Transient(format!("archive upload failed: {e}")))
            }
        })
        .await?;
        self.readiness.record_object_store_head();

        self.metadata_store
            .mark_uploaded(&container_id, stats.file_count, stats.byte_size)
            .await?;
        for claim in &claims {
            self.metadata_store_mark_packed_best_effort(claim, &container_id).await;
        }
        let _ = tokio::fs::remove_file(&tmp_path).await;
        Ok(())
    }

    async fn metadata_store_mark_packed_best_effort(&self, claim: &PendingFile, container_id: &str) {
        if let Err(e) = self.provider.mark_packed(claim, container_id).await {
            tracing::warn!(claim_id = %claim.id, container_id, error = %e, "mark_packed failed; crash recovery will reconcile");
        }
    }

    /// Finalize-on-shutdown policy (§5): commit if at least
    /// `min_commit_files` are buffered, otherwise abort and let recovery
    /// revert the claims to `pending`.
    async fn finalize_on_shutdown(&self, container: OpenContainer) -> DesResult<()> {
        if container.writer.file_count() as u64 >= self.config.min_commit_files {
            tokio::time::timeout(self.config.shutdown_grace, self.finalize_and_commit(container))
                .await
                .map_err(|_| DesError::Transient("shutdown grace period expired before upload completed".into()))?
        } else {
            self.abort_container(container).await;
            Ok(())
        }
    }

    async fn abort_container(&self, container: OpenContainer) {
        let OpenContainer { writer, container_id, .. } = container;
        let _ = writer.abort();
        let _ = self.metadata_store.abandon(&container_id).await;
    }
}

fn archive_key(day: &NaiveDate, shard_id: u32, shard_bits: u32, container_id: &str) -> String {
    format!("{day}/{}/{container_id}.des", shard_hex(shard_id, shard_bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_hex_is_zero_padded_to_nibble_width() {
        assert_eq!(shard_hex(5, 8), "05");
        assert_eq!(shard_hex(5, 3), "5");
        assert_eq!(shard_hex(255, 8), "ff");
    }

    #[test]
    fn archive_key_layout_matches_day_shard_container() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(archive_key(&day, 2, 8, "ctr1"), "2024-03-05/02/ctr1.des");
    }
}
