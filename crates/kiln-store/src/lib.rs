//! Artifact storage for kiln.
//!
//! This crate provides the persistence layer behind the build cache: a
//! content-addressable `ObjectStore` of packed package archives, an
//! `ArtifactStore` of checksummed records keyed by build fingerprint,
//! deterministic `pack_package`/`unpack_package` helpers, and the on-disk
//! `StoreLayout`.

pub mod artifacts;
pub mod layout;
pub mod objects;
pub mod package;

pub use artifacts::{ArtifactRecord, ArtifactStore};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use objects::ObjectStore;
pub use package::{list_files, pack_package, unpack_package};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{hash}': expected {expected}, got {actual}")]
    IntegrityFailure {
        hash: String,
        expected: String,
        actual: String,
    },
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
