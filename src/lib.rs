//! # des-store — Datavision Easy Store (DES) container format and packer
//!
//! Format guarantees (frozen in v1):
//! - All numeric fields are little-endian
//! - HEADER is 16 fixed bytes; nothing at offset 0 ever depends on anything
//!   written later, which is what makes the format genuinely append-only
//! - FOOTER is 80 fixed bytes and always ends the stream; its trailing 8
//!   bytes are the `DESFOOT1` magic, readable with one range GET regardless
//!   of object size
//! - The INDEX sits between META and FOOTER; a reader needs only the
//!   trailing FOOTER plus one more range read to get the full file list
//! - Per-file metadata is canonical JSON (sorted object keys, compact
//!   writer) so two writers given the same logical meta always emit
//!   identical bytes
//! - Readers refuse any stream whose declared `version` exceeds
//!   [`format::FORMAT_VERSION`] or whose trailing magic doesn't match

pub mod blob;
pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod meta;
pub mod metadata_store;
pub mod metrics;
pub mod naming;
pub mod packer;
pub mod range_reader;
pub mod reader;
pub mod recovery;
pub mod shard;
pub mod source;
pub mod writer;

// Flat re-exports for the most common types.
pub use blob::{ExternalBlobStore, ObjectStoreBlob};
pub use cache::{CacheKey, IndexCache, MemoryIndexCache, NullIndexCache};
pub use error::{DesError, DesResult, Retryability};
pub use format::{Footer, Header, IndexEntry, FOOTER_SIZE, HEADER_SIZE};
pub use metadata_store::{ContainerRecord, ContainerState, MetadataStore, PostgresMetadataStore, ShardLease};
pub use naming::{NameGenerator, NameGeneratorConfig};
pub use packer::{Packer, PackerConfig};
pub use range_reader::RangeReader;
pub use reader::local::LocalReader;
pub use recovery::{CrashRecovery, CrashRecoveryConfig, RecoveryReport};
pub use shard::{consistent_hash, shard_assignment};
pub use source::{SourceConfig, SourceDialect, SourceProvider, SourceProviderImpl};
pub use writer::{ContainerWriter, WriteOptions};
