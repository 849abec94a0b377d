//! Snapshot segments.
//!
//! A segment is an immutable file holding every contact as of some WAL
//! sequence number. Each compaction writes a complete snapshot, so recovery
//! loads only the newest segment and replays the WAL entries after it.
//!
//! # Design
//! - Segments are numbered sequentially (`segment_00001.seg`, ...)
//! - Written to a uniquely named temp file, fsynced, then renamed into place
//! - Older segments are deleted once a newer one is durable

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contact::Contact;

use super::codec;

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_EXT: &str = "seg";
const TEMP_MARKER: &str = ".tmp.";

/// Contacts per on-disk record.
pub const CHUNK_LEN: usize = 4096;

/// Segment file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Highest WAL sequence whose effects are included.
    pub covered_sequence: u64,
    /// Number of contacts in the snapshot.
    pub contact_count: u64,
    /// Highest id ever allocated; ids are never reused.
    pub last_id: u64,
    /// When the segment was written.
    pub created_at: DateTime<Utc>,
}

/// Snapshot payload.
///
/// On disk the contacts follow the header in chunks of [`CHUNK_LEN`], so a
/// large table never hits the codec's per-record limit.
#[derive(Debug, Clone, Default)]
pub struct SegmentData {
    /// Every stored contact, soft-deleted ones included.
    pub contacts: Vec<Contact>,
    /// Highest id ever allocated; ids are never reused.
    pub last_id: u64,
}

/// A durable segment on disk.
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    number: u32,
    covered_sequence: u64,
}

impl Segment {
    fn open(path: &Path, number: u32) -> IoResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let _version = codec::read_header(&mut reader)?;
        let header: SegmentHeader = codec::decode(&mut reader)?;

        Ok(Self {
            path: path.to_path_buf(),
            number,
            covered_sequence: header.covered_sequence,
        })
    }

    /// Path of the segment file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest WAL sequence captured by this segment.
    #[must_use]
    pub fn covered_sequence(&self) -> u64 {
        self.covered_sequence
    }

    /// Read the snapshot payload.
    pub fn read_data(&self) -> IoResult<SegmentData> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let _version = codec::read_header(&mut reader)?;
        let header: SegmentHeader = codec::decode(&mut reader)?;

        let expected = usize::try_from(header.contact_count)
            .map_err(|_| IoError::new(ErrorKind::InvalidData, "segment contact count overflows usize"))?;
        let mut contacts = Vec::with_capacity(expected);
        while contacts.len() < expected {
            let chunk: Vec<Contact> = codec::decode(&mut reader)?;
            if chunk.is_empty() || contacts.len() + chunk.len() > expected {
                return Err(IoError::new(
                    ErrorKind::InvalidData,
                    format!(
                        "segment {} declares {expected} contacts but chunks disagree",
                        self.path.display()
                    ),
                ));
            }
            contacts.extend(chunk);
        }

        Ok(SegmentData {
            contacts,
            last_id: header.last_id,
        })
    }
}

/// Writes one segment via temp file + rename.
///
/// Dropping the writer before [`SegmentWriter::finalize`] removes the temp file.
pub struct SegmentWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    number: u32,
    writer: Option<BufWriter<File>>,
}

impl SegmentWriter {
    fn new(final_path: PathBuf, number: u32) -> IoResult<Self> {
        let file_name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("segment");
        let temp_path = final_path.with_file_name(format!("{file_name}{TEMP_MARKER}{}", Uuid::new_v4()));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path,
            number,
            writer: Some(writer),
        })
    }

    /// Write the snapshot, fsync it and rename it into place.
    ///
    /// This is the commit point: once it returns, the segment survives a crash.
    pub fn finalize(mut self, data: &SegmentData, covered_sequence: u64) -> IoResult<Segment> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "segment writer already consumed"))?;

        let header = SegmentHeader {
            covered_sequence,
            contact_count: data.contacts.len() as u64,
            last_id: data.last_id,
            created_at: Utc::now(),
        };
        writer.write_all(&codec::encode(&header)?)?;
        for chunk in data.contacts.chunks(CHUNK_LEN) {
            writer.write_all(&codec::encode(&chunk)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        let temp_path = self
            .temp_path
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "segment temp path already consumed"))?;
        fs::rename(&temp_path, &self.final_path)?;
        sync_dir(&self.final_path)?;

        Ok(Segment {
            path: self.final_path.clone(),
            number: self.number,
            covered_sequence,
        })
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        self.writer.take();
        if let Some(temp_path) = self.temp_path.take() {
            let _ = fs::remove_file(temp_path);
        }
    }
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> IoResult<()> {
    match path.parent() {
        Some(dir) => File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> IoResult<()> {
    Ok(())
}

fn parse_segment_number(path: &Path) -> Option<u32> {
    if path.extension()? != SEGMENT_EXT {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .parse()
        .ok()
}

/// Tracks the segment files of one database directory.
#[derive(Debug)]
pub struct SegmentManager {
    dir: PathBuf,
    segments: Vec<Segment>,
    next_number: u32,
}

impl SegmentManager {
    /// Open or create the segment directory.
    ///
    /// Leftover temp files from an interrupted compaction are removed. A
    /// segment whose header cannot be read is an error: it was renamed into
    /// place only after an fsync, so damage there is real corruption.
    pub fn open(dir: &Path) -> IoResult<Self> {
        fs::create_dir_all(dir)?;

        let mut segments = Vec::new();
        let mut next_number = 1u32;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();

            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(TEMP_MARKER));
            if is_temp {
                tracing::debug!(path = %path.display(), "removing stale segment temp file");
                let _ = fs::remove_file(&path);
                continue;
            }

            let Some(number) = parse_segment_number(&path) else {
                continue;
            };
            next_number = next_number.max(number.saturating_add(1));
            let segment = Segment::open(&path, number).map_err(|e| {
                IoError::new(e.kind(), format!("unreadable segment {}: {e}", path.display()))
            })?;
            segments.push(segment);
        }

        segments.sort_by_key(|s| s.number);

        Ok(Self {
            dir: dir.to_path_buf(),
            segments,
            next_number,
        })
    }

    /// All known segments, oldest first.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The newest segment, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// Highest WAL sequence captured by a segment.
    #[must_use]
    pub fn persisted_sequence(&self) -> u64 {
        self.latest().map_or(0, Segment::covered_sequence)
    }

    /// Start writing the next segment.
    pub fn create_writer(&mut self) -> IoResult<SegmentWriter> {
        let number = self.next_number;
        self.next_number = self.next_number.saturating_add(1);
        let path = self.dir.join(format!("{SEGMENT_PREFIX}{number:05}.{SEGMENT_EXT}"));
        SegmentWriter::new(path, number)
    }

    /// Register a finalized segment and delete the ones it supersedes.
    pub fn install(&mut self, segment: Segment) -> IoResult<()> {
        let keep = segment.number;
        self.segments.push(segment);
        self.segments.sort_by_key(|s| s.number);

        let (old, current): (Vec<_>, Vec<_>) = self.segments.drain(..).partition(|s| s.number < keep);
        self.segments = current;
        for segment in old {
            if let Err(e) = fs::remove_file(segment.path()) {
                tracing::warn!(path = %segment.path().display(), error = %e, "failed to remove superseded segment");
            }
        }
        Ok(())
    }
}
