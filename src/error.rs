//! The error taxonomy shared by every DES component.
//!
//! Every kind named in the format/operational spec gets exactly one variant
//! here; callers match on kind, not on the wrapped transport error. Readers
//! and writers never swallow an error — only the packer's per-file batch
//! loop downgrades an error to a recorded failure (see `packer::run`).

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesError {
    /// Bad magic, bad offsets, truncated stream, or an unknown format version.
    /// Fatal for the read in progress; the index cache must not retain
    /// anything parsed on this path.
    #[error("corrupt container: {0}")]
    CorruptContainer(String),

    /// `add` rejected because the name already exists in this container.
    #[error("name already present in container: {0:?}")]
    NameConflict(String),

    /// `add` rejected because the name fails the validity rules in §6.1.
    #[error("invalid file name {0:?}: {1}")]
    InvalidName(String, &'static str),

    /// The requested name is not present in the container's index.
    #[error("container {container} has no file named {name:?}")]
    NotFound { container: String, name: String },

    /// Network/5xx/serialization-failure/deadlock class — retry with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Auth/not-found-for-write/validation class — never retried.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// A shard's lease was lost (renew failed or a competing owner holds it).
    /// Internal signal; the packer reacts by moving the shard task to `Lost`.
    #[error("lease lost for shard {shard_id} (owner {owner_id})")]
    LeaseLost { shard_id: u32, owner_id: String },

    /// A fetch against the external blob sidecar failed; the cause has
    /// already been reclassified into `Transient` or `Permanent` by the
    /// blob handle before this variant is constructed.
    #[error("external fetch failed: {0}")]
    ExternalFetchFailed(String),

    /// Bad or missing configuration; fatal at startup, never retried.
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type DesResult<T> = Result<T, DesError>;

impl DesError {
    /// Classify an opaque underlying error into the transient/permanent
    /// split spec.md §4.9 requires for storage/DB calls. Used at the
    /// boundary where we wrap `sqlx::Error` / `object_store::Error`.
    pub fn classify_io(err: &io::Error) -> Retryability {
        match err.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => Retryability::Transient,
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
                Retryability::Permanent
            }
            _ => Retryability::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DesError::Transient(_))
    }
}

/// The three-way retry classification from spec.md §4.9 / §7. `Unknown` is
/// treated conservatively as `Transient` by callers (see `packer::retry`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Transient,
    Permanent,
    Unknown,
}

impl Retryability {
    pub fn should_retry(self) -> bool {
        !matches!(self, Retryability::Permanent)
    }
}
