//! Write-Ahead Log (WAL) for crash recovery.
//!
//! The WAL provides durability by:
//! 1. Writing every contact mutation to an append-only log before applying it
//! 2. Using fsync to ensure data reaches disk
//! 3. Replaying the log on startup to recover state
//!
//! A torn or corrupted tail (crash mid-append) is cut off on open, so new
//! appends never land behind garbage.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId};

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number; never reset by truncation.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The mutation being logged.
    pub kind: WalEntryKind,
}

/// The mutation recorded by a WAL entry.
///
/// Entries carry their own timestamps so replay reproduces `updated_at`
/// and `deleted_at` exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// A newly created contact, exactly as stored.
    ContactInsert(Contact),
    /// A primary flipped to secondary.
    ContactDemote {
        id: ContactId,
        linked_id: ContactId,
        at: DateTime<Utc>,
    },
    /// Children of one primary re-pointed at another.
    ContactRelink {
        old_primary_id: ContactId,
        new_primary_id: ContactId,
        at: DateTime<Utc>,
    },
    /// An atomic multi-cluster merge.
    ClusterMerge {
        survivor: ContactId,
        demoted: Vec<ContactId>,
        at: DateTime<Utc>,
    },
    /// A soft deletion.
    ContactSoftDelete { id: ContactId, at: DateTime<Utc> },
}

/// The file a WAL appends to.
trait LogFile: Write {
    fn sync_all(&mut self) -> IoResult<()>;
    fn set_len(&mut self, len: u64) -> IoResult<()>;
}

impl LogFile for File {
    fn sync_all(&mut self) -> IoResult<()> {
        File::sync_all(self)
    }

    fn set_len(&mut self, len: u64) -> IoResult<()> {
        File::set_len(self, len)
    }
}

/// Append state. Each entry is encoded up front and written unbuffered, so
/// a failed write leaves nothing queued behind it.
struct WalWriter<F = File> {
    file: F,
    sequence: u64,
    /// File length up to the end of the last fully written entry.
    committed_len: u64,
    /// Set when a failed append could not be cut back off the file.
    failed: bool,
}

impl<F: LogFile> WalWriter<F> {
    fn new(file: F, sequence: u64, committed_len: u64) -> Self {
        Self {
            file,
            sequence,
            committed_len,
            failed: false,
        }
    }

    fn append(&mut self, kind: WalEntryKind, sync: bool) -> IoResult<u64> {
        if self.failed {
            return Err(IoError::new(
                ErrorKind::Other,
                "WAL has an unrecoverable partial entry; reopen the database",
            ));
        }

        let candidate = self.sequence + 1;
        let entry = WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            kind,
        };
        let encoded = codec::encode(&entry)?;

        if let Err(e) = self.write_entry(&encoded, sync) {
            self.rollback(sync);
            return Err(e);
        }

        self.committed_len += encoded.len() as u64;
        self.sequence = candidate;
        Ok(candidate)
    }

    fn write_entry(&mut self, encoded: &[u8], sync: bool) -> IoResult<()> {
        self.file.write_all(encoded)?;
        self.file.flush()?;
        if sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Cut the file back to the last committed entry.
    fn rollback(&mut self, sync: bool) {
        let result = self.file.set_len(self.committed_len).and_then(|()| {
            if sync {
                self.file.sync_all()
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            tracing::error!(
                committed_len = self.committed_len,
                error = %e,
                "WAL rollback failed; refusing further appends"
            );
            self.failed = true;
        }
    }
}

/// Write-Ahead Log for crash recovery.
///
/// Thread-safe via internal mutex. A failed append is rolled back before
/// the error is returned, so a mutation reported as failed never replays.
pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalWriter>,
    sync_on_write: bool,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "WAL lock poisoned")
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// `base_sequence` is the highest sequence already captured by a
    /// segment; numbering continues from whichever is larger, that or the
    /// last entry found in the file.
    pub fn open(path: &Path, sync_on_write: bool, base_sequence: u64) -> IoResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let last_sequence = if len < codec::HEADER_LEN {
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        } else {
            let (last_sequence, valid_len) = Self::scan(path)?;
            if valid_len < len {
                tracing::warn!(
                    path = %path.display(),
                    valid_len,
                    file_len = len,
                    "WAL has a torn or corrupted tail; truncating to the last valid entry"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            last_sequence
        };
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        let committed_len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalWriter::new(
                file,
                last_sequence.max(base_sequence),
                committed_len,
            )),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalWriter>> {
        self.inner.lock().map_err(|_| poisoned())
    }

    /// Append an entry to the WAL.
    ///
    /// Returns the sequence number assigned to this entry. The sequence only
    /// advances once the entry is fully written; on error the file is cut
    /// back to where it was.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        self.lock()?.append(kind, self.sync_on_write)
    }

    /// Flush buffered bytes and fsync, regardless of `sync_on_write`.
    pub fn sync(&self) -> IoResult<()> {
        self.lock()?.file.sync_all()
    }

    /// Iterate over all entries in the WAL.
    ///
    /// Used during recovery to replay mutations.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Get the current sequence number.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// Get the WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Drop every entry, keeping the sequence counter.
    ///
    /// Only call this once a segment covering `current_sequence()` is durable.
    pub fn truncate(&self) -> IoResult<()> {
        let mut inner = self.lock()?;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        codec::write_header(&mut file)?;
        if self.sync_on_write {
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&self.path)?;
        let sequence = inner.sequence;
        *inner = WalWriter::new(file, sequence, codec::HEADER_LEN);
        Ok(())
    }

    /// Returns the last good sequence number and the byte length up to the
    /// end of the last good entry.
    fn scan(path: &Path) -> IoResult<(u64, u64)> {
        let mut iter = WalIterator::new(path)?;
        let mut last_seq = 0;
        let mut valid_len = codec::HEADER_LEN;

        loop {
            match iter.next_entry() {
                Ok(Some(entry)) => {
                    last_seq = entry.sequence;
                    valid_len = iter.position()?;
                }
                Ok(None) => break,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        after_sequence = last_seq,
                        error = %e,
                        "WAL corruption detected"
                    );
                    break;
                }
            }
        }

        Ok((last_seq, valid_len))
    }
}

/// Iterator over WAL entries.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let _version = codec::read_header(&mut reader)?;

        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }

    fn next_entry(&mut self) -> IoResult<Option<WalEntry>> {
        if self.position()? >= self.file_size {
            return Ok(None);
        }
        codec::decode(&mut self.reader).map(Some)
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
