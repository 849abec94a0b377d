//! The persistent contact store.
//!
//! The store wraps:
//! - A [`ContactIndex`] for all reads
//! - The WAL for durable writes
//! - The segment manager for compacted snapshots
//!
//! Every mutation holds the index write lock across validate, WAL append and
//! apply, so WAL order is exactly the order mutations became visible.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use crate::contact::{Contact, ContactId, NewContact};
use crate::error::{ReconcileError, ReconcileResult};
use crate::storage::index::ContactIndex;
use crate::storage::traits::{ContactStore, StorageError};

use super::file_lock::DirLock;
use super::segment::{SegmentData, SegmentManager};
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "contacts.wal";
const SEGMENTS_DIR: &str = "segments";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn open_err(what: &str, err: impl std::fmt::Display) -> ReconcileError {
    StorageError::BackendError(format!("failed to {what}: {err}")).into()
}

/// Result of a compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Contacts written to the new segment.
    pub contacts_written: usize,
    /// Path to the new segment, or `None` if nothing changed since the last one.
    pub segment_path: Option<PathBuf>,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

/// Durable, single-process contact store.
pub struct PersistentContactStore {
    dir: PathBuf,
    _lock: DirLock,
    wal: WriteAheadLog,
    segments: Mutex<SegmentManager>,
    index: RwLock<ContactIndex>,
    config: PersistentConfig,
}

impl std::fmt::Debug for PersistentContactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentContactStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentContactStore {
    /// Open or create a contact database in `dir`.
    ///
    /// Loads the newest segment, then replays WAL entries it does not cover.
    pub fn open(dir: &Path, config: PersistentConfig) -> ReconcileResult<Self> {
        fs::create_dir_all(dir).map_err(|e| open_err("create database directory", e))?;
        let lock = DirLock::acquire(dir).map_err(|e| open_err("acquire lock", e))?;

        let segments =
            SegmentManager::open(&dir.join(SEGMENTS_DIR)).map_err(|e| open_err("open segments", e))?;

        let (mut index, covered) = match segments.latest() {
            Some(segment) => {
                let data = segment
                    .read_data()
                    .map_err(|e| open_err("load segment data", e))?;
                (
                    ContactIndex::from_contacts(data.contacts, data.last_id),
                    segment.covered_sequence(),
                )
            }
            None => (ContactIndex::default(), 0),
        };

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write, covered)
            .map_err(|e| open_err("open WAL", e))?;
        let replayed = replay(&wal, &mut index, covered)?;

        tracing::info!(
            dir = %dir.display(),
            contacts = index.len(),
            segment_sequence = covered,
            replayed,
            "opened contact database"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            segments: Mutex::new(segments),
            index: RwLock::new(index),
            config,
        })
    }

    /// The database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of stored contacts, soft-deleted ones included.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.read("contact.len")?.len())
    }

    /// Returns true if nothing has been stored yet.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Current WAL size in bytes.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        self.wal
            .size_bytes()
            .map_err(|e| StorageError::BackendError(format!("WAL stat failed: {e}")))
    }

    /// Number of segment files on disk.
    pub fn segment_count(&self) -> Result<usize, StorageError> {
        Ok(self
            .segments
            .lock()
            .map_err(|_| lock_err("segments.count"))?
            .segments()
            .len())
    }

    /// Snapshot all contacts into a new segment and truncate the WAL.
    ///
    /// Writers are blocked for the duration; readers are not. If this fails
    /// partway through, the WAL still holds everything and is replayed on
    /// the next open.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let index = self.read("contact.compact")?;
        let mut segments = self.segments.lock().map_err(|_| lock_err("segments.compact"))?;

        let wal_size_before = self.wal_size()?;
        let covered = self.wal.current_sequence().map_err(wal_err)?;
        if covered == segments.persisted_sequence() {
            return Ok(CompactionResult {
                contacts_written: 0,
                segment_path: None,
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let data = SegmentData {
            contacts: index.contacts().cloned().collect(),
            last_id: index.last_id(),
        };
        let segment = segments
            .create_writer()
            .and_then(|writer| writer.finalize(&data, covered))
            .map_err(|e| StorageError::BackendError(format!("segment write failed: {e}")))?;
        let segment_path = segment.path().to_path_buf();

        self.wal.truncate().map_err(wal_err)?;
        segments
            .install(segment)
            .map_err(|e| StorageError::BackendError(format!("segment install failed: {e}")))?;

        let wal_size_after = self.wal_size()?;
        tracing::info!(
            segment = %segment_path.display(),
            contacts = data.contacts.len(),
            covered_sequence = covered,
            wal_size_before,
            wal_size_after,
            "compacted contact database"
        );

        Ok(CompactionResult {
            contacts_written: data.contacts.len(),
            segment_path: Some(segment_path),
            wal_size_before,
            wal_size_after,
        })
    }

    fn read(&self, context: &'static str) -> Result<RwLockReadGuard<'_, ContactIndex>, StorageError> {
        self.index.read().map_err(|_| lock_err(context))
    }

    fn write(&self, context: &'static str) -> Result<RwLockWriteGuard<'_, ContactIndex>, StorageError> {
        self.index.write().map_err(|_| lock_err(context))
    }

    fn log(&self, kind: WalEntryKind) -> Result<u64, StorageError> {
        self.wal.append(kind).map_err(wal_err)
    }

    /// Compact once the WAL outgrows its budget. The triggering write is
    /// already durable, so a failure here is only logged.
    fn maybe_compact(&self) {
        match self.wal.size_bytes() {
            Ok(size) if size > self.config.max_wal_size => {
                if let Err(e) = self.compact() {
                    tracing::warn!(error = %e, wal_size = size, "automatic compaction failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "could not stat WAL"),
        }
    }
}

fn wal_err(e: std::io::Error) -> StorageError {
    StorageError::BackendError(format!("WAL write failed: {e}"))
}

/// Apply every WAL entry past `covered` to `index`. Returns the count applied.
///
/// Sequences must strictly increase; a repeated or backwards sequence means
/// the log holds an entry that was never acknowledged, and opening fails.
fn replay(wal: &WriteAheadLog, index: &mut ContactIndex, covered: u64) -> ReconcileResult<usize> {
    let iter = wal.iter().map_err(|e| open_err("iterate WAL", e))?;

    let mut applied = 0;
    let mut previous = 0;
    for entry in iter {
        let entry = entry.map_err(|e| open_err("read WAL entry", e))?;
        if entry.sequence <= previous {
            return Err(open_err(
                "replay WAL",
                format!("entry sequence {} does not follow {previous}", entry.sequence),
            ));
        }
        previous = entry.sequence;
        if entry.sequence <= covered {
            continue;
        }

        let sequence = entry.sequence;
        let result = match entry.kind {
            WalEntryKind::ContactInsert(contact) => {
                index.insert(contact);
                Ok(())
            }
            WalEntryKind::ContactDemote { id, linked_id, at } => index.demote(id, linked_id, at),
            WalEntryKind::ContactRelink {
                old_primary_id,
                new_primary_id,
                at,
            } => index.relink_children(old_primary_id, new_primary_id, at).map(|_| ()),
            WalEntryKind::ClusterMerge { survivor, demoted, at } => {
                index.merge_clusters(survivor, &demoted, at)
            }
            WalEntryKind::ContactSoftDelete { id, at } => index.soft_delete(id, at).map(|_| ()),
        };
        result.map_err(|e| open_err(&format!("replay WAL entry {sequence}"), e))?;
        applied += 1;
    }

    Ok(applied)
}

impl ContactStore for PersistentContactStore {
    fn find_by_identifiers(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        Ok(self
            .read("contact.find_by_identifiers")?
            .find_by_identifiers(email, phone_number))
    }

    fn find_by_cluster_root(&self, primary_id: ContactId) -> Result<Vec<Contact>, StorageError> {
        Ok(self.read("contact.find_by_cluster_root")?.find_by_cluster_root(primary_id))
    }

    fn find_by_ids(&self, ids: &[ContactId]) -> Result<Vec<Contact>, StorageError> {
        Ok(self.read("contact.find_by_ids")?.find_by_ids(ids))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        Ok(self.read("contact.get")?.get(id).cloned())
    }

    fn create(&self, contact: NewContact) -> Result<Contact, StorageError> {
        let mut index = self.write("contact.create")?;
        let contact = index.allocate(&contact, Utc::now())?;
        self.log(WalEntryKind::ContactInsert(contact.clone()))?;
        index.insert(contact.clone());
        drop(index);

        self.maybe_compact();
        Ok(contact)
    }

    fn demote(&self, contact_id: ContactId, new_linked_id: ContactId) -> Result<(), StorageError> {
        let mut index = self.write("contact.demote")?;
        index.validate_demote(contact_id, new_linked_id)?;
        let at = Utc::now();
        self.log(WalEntryKind::ContactDemote {
            id: contact_id,
            linked_id: new_linked_id,
            at,
        })?;
        index.demote(contact_id, new_linked_id, at)?;
        drop(index);

        self.maybe_compact();
        Ok(())
    }

    fn relink_children(
        &self,
        old_primary_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<usize, StorageError> {
        let mut index = self.write("contact.relink_children")?;
        index.validate_relink(old_primary_id, new_primary_id)?;
        let at = Utc::now();
        self.log(WalEntryKind::ContactRelink {
            old_primary_id,
            new_primary_id,
            at,
        })?;
        let moved = index.relink_children(old_primary_id, new_primary_id, at)?;
        drop(index);

        self.maybe_compact();
        Ok(moved)
    }

    fn merge_clusters(&self, survivor: ContactId, demoted: &[ContactId]) -> Result<(), StorageError> {
        if demoted.is_empty() {
            return Ok(());
        }

        let mut index = self.write("contact.merge_clusters")?;
        index.validate_merge(survivor, demoted)?;
        let at = Utc::now();
        self.log(WalEntryKind::ClusterMerge {
            survivor,
            demoted: demoted.to_vec(),
            at,
        })?;
        index.merge_clusters(survivor, demoted, at)?;
        drop(index);

        self.maybe_compact();
        Ok(())
    }

    fn soft_delete(&self, id: ContactId) -> Result<(), StorageError> {
        let mut index = self.write("contact.soft_delete")?;
        let Some(existing) = index.get(id) else {
            return Err(StorageError::ContactNotFound(id));
        };
        if existing.is_deleted() {
            return Ok(());
        }

        let at = Utc::now();
        self.log(WalEntryKind::ContactSoftDelete { id, at })?;
        index.soft_delete(id, at)?;
        drop(index);

        self.maybe_compact();
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.wal
            .sync()
            .map_err(|e| StorageError::BackendError(format!("WAL sync failed: {e}")))
    }
}
