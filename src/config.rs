//! Typed configuration shapes — §6.4/§2.5. spec.md names the *fields* a
//! deployment needs; parsing a particular file format (YAML/TOML/JSON) is
//! glue left to the caller, so these are plain `serde::Deserialize` structs
//! with no I/O of their own, the same way the teacher's `FileIndex`/
//! `RecoveryMap` are serde shapes with their own `to_bytes`/`from_bytes`
//! rather than file-format-aware loaders.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::source::SourceDialect;

/// One entry in `sources: [...]` — §6.4.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDbConfig {
    pub connection_string: String,
    pub dialect: SourceDialect,
    pub table: String,
    pub schema: Option<String>,
    pub mapping: ColumnMappingConfig,
    pub status_pending_value: String,
    pub status_claimed_value: String,
    pub status_packed_value: String,
    pub status_failed_value: String,
    pub shard_bits: u32,
    pub batch_size: usize,
    pub claim_timeout_seconds: u64,
    #[serde(default)]
    pub metadata_columns: HashMap<String, String>,
    pub where_clause: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMappingConfig {
    pub id: String,
    pub bucket: String,
    pub key: String,
    pub size_bytes: String,
    pub status: String,
    pub created_at: String,
    pub claimed_at: String,
    pub shard_key: Option<String>,
}

impl From<ColumnMappingConfig> for crate::source::ColumnMapping {
    fn from(c: ColumnMappingConfig) -> Self {
        crate::source::ColumnMapping {
            id: c.id,
            bucket: c.bucket,
            key: c.key,
            size_bytes: c.size_bytes,
            status: c.status,
            created_at: c.created_at,
            claimed_at: c.claimed_at,
            shard_key: c.shard_key,
        }
    }
}

fn default_lease_ttl_seconds() -> u64 {
    30
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

fn default_min_commit_files() -> u64 {
    1
}

fn default_checkpoint_interval_files() -> u64 {
    500
}

fn default_checkpoint_interval_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_max_container_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_max_files_per_container() -> u64 {
    100_000
}

fn default_initial_batch_size() -> usize {
    32
}

fn default_max_batch_size() -> usize {
    256
}

fn default_idle_poll_interval_seconds() -> u64 {
    5
}

/// Process-wide packer configuration — §4.9/§5. Deserializes from the same
/// config file as the source list; `into_packer_config` fills in the
/// `Duration`-typed fields `PackerConfig` actually runs with.
#[derive(Debug, Clone, Deserialize)]
pub struct PackerRuntimeConfig {
    pub workdir: String,
    pub archive_bucket: String,
    pub node_id: u8,
    pub name_prefix: String,
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "default_min_commit_files")]
    pub min_commit_files: u64,
    #[serde(default = "default_checkpoint_interval_files")]
    pub checkpoint_interval_files: u64,
    #[serde(default = "default_checkpoint_interval_bytes")]
    pub checkpoint_interval_bytes: u64,
    #[serde(default = "default_max_container_bytes")]
    pub max_container_bytes: u64,
    #[serde(default = "default_max_files_per_container")]
    pub max_files_per_container: u64,
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_idle_poll_interval_seconds")]
    pub idle_poll_interval_seconds: u64,
}

impl PackerRuntimeConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_secs(self.idle_poll_interval_seconds)
    }
}

/// Top-level deployment config: one metadata-store connection, one archive
/// object-store target, any number of source DBs sharing the shard space.
#[derive(Debug, Clone, Deserialize)]
pub struct DesConfig {
    pub metadata_store_url: String,
    pub packer: PackerRuntimeConfig,
    pub sources: Vec<SourceDbConfig>,
    #[serde(default)]
    pub readiness_staleness_seconds: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_toml() {
        let toml_src = r#"
            metadata_store_url = "postgres://localhost/des"

            [packer]
            workdir = "/tmp/des"
            archive_bucket = "des-archive"
            node_id = 3
            name_prefix = "DES"

            [[sources]]
            connection_string = "postgres://localhost/app"
            dialect = "postgres"
            table = "uploads"

            [sources.mapping]
            id = "id"
            bucket = "bucket"
            key = "object_key"
            size_bytes = "size_bytes"
            status = "status"
            created_at = "created_at"
            claimed_at = "claimed_at"

            status_pending_value = "pending"
            status_claimed_value = "claimed"
            status_packed_value = "packed"
            status_failed_value = "failed"
            shard_bits = 8
            batch_size = 50
            claim_timeout_seconds = 60
        "#;
        let cfg: DesConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.sources.len(), 1);
        assert_eq!(cfg.packer.lease_ttl(), Duration::from_secs(30));
        assert_eq!(cfg.sources[0].dialect, SourceDialect::Postgres);
    }
}
