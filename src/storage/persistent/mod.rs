//! Persistent storage backend.
//!
//! This module provides durable, crash-safe contact storage with:
//! - Write-Ahead Logging (WAL) for crash recovery
//! - File locking for single-process access
//! - CRC32 checksums for corruption detection
//! - Snapshot segments written by compaction
//!
//! # Layout
//!
//! ```text
//! <data dir>/
//! ├── LOCK                  exclusive flock, holder pid
//! ├── contacts.wal          append-only mutation log
//! └── segments/
//!     └── segment_00007.seg newest full snapshot
//! ```

mod codec;
mod file_lock;
mod segment;
mod stores;
mod wal;

pub use file_lock::DirLock;
pub use segment::{Segment, SegmentData, SegmentManager, SegmentWriter};
pub use stores::{CompactionResult, PersistentContactStore};
pub use wal::{WalEntry, WalEntryKind, WalIterator, WriteAheadLog};

use std::path::Path;

use crate::error::{ReconcileResult, ValidationError};

/// Configuration for persistent storage.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// WAL size that triggers an automatic compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    /// Smallest accepted `max_wal_size`; anything lower compacts on nearly every write.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Check the configuration, returning it unchanged when valid.
    pub fn validate(self) -> ReconcileResult<Self> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                field: "max_wal_size".to_string(),
                reason: format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            }
            .into());
        }
        Ok(self)
    }
}

/// Open or create a persistent contact database at `path`.
///
/// # Errors
/// - invalid configuration
/// - the directory cannot be created or another process holds its lock
/// - a segment or WAL entry is corrupt beyond a torn tail
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use identity_reconciler::{IdentityResolver, storage::open_database};
///
/// let store = Arc::new(open_database("./contacts.db", None)?);
/// let resolver = IdentityResolver::new(store);
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> ReconcileResult<PersistentContactStore> {
    let config = config.unwrap_or_default().validate()?;
    PersistentContactStore::open(path.as_ref(), config)
}
