//! Log segment files.
//!
//! The active segment is named `segment-open-<firstIndex>`; sealing renames
//! it to `segment-<firstIndex>-<lastIndex>`. Names alone let a cold-start
//! scan rebuild the in-memory index.

use super::entry::LogEntry;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const OPEN_PREFIX: &str = "segment-open-";
const CLOSED_PREFIX: &str = "segment-";

/// Parsed segment file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentName {
    Open { first: u64 },
    Closed { first: u64, last: u64 },
}

impl SegmentName {
    /// Parse a directory entry name; `None` for non-segment files.
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(rest) = name.strip_prefix(OPEN_PREFIX) {
            return rest.parse().ok().map(|first| SegmentName::Open { first });
        }
        let rest = name.strip_prefix(CLOSED_PREFIX)?;
        let (first, last) = rest.split_once('-')?;
        Some(SegmentName::Closed {
            first: first.parse().ok()?,
            last: last.parse().ok()?,
        })
    }

    pub fn first(&self) -> u64 {
        match self {
            SegmentName::Open { first } | SegmentName::Closed { first, .. } => *first,
        }
    }
}

pub fn open_segment_path(dir: &Path, first: u64) -> PathBuf {
    dir.join(format!("{}{}", OPEN_PREFIX, first))
}

pub fn closed_segment_path(dir: &Path, first: u64, last: u64) -> PathBuf {
    dir.join(format!("{}{}-{}", CLOSED_PREFIX, first, last))
}

/// One segment plus its in-memory record index.
#[derive(Debug)]
pub struct Segment {
    pub path: PathBuf,
    pub first_index: u64,
    /// Inclusive; `first_index - 1` when the segment holds no entries.
    pub last_index: u64,
    /// Byte offset of the record for `first_index + i`.
    pub offsets: Vec<u64>,
    /// Term runs within this segment: (first index of run, term).
    pub term_runs: Vec<(u64, u64)>,
    pub len_bytes: u64,
    pub sealed: bool,
}

impl Segment {
    /// Create a fresh, empty active segment.
    pub fn create_open(dir: &Path, first_index: u64) -> Result<Self> {
        let path = open_segment_path(dir, first_index);
        File::create(&path)?.sync_all()?;
        Ok(Self {
            path,
            first_index,
            last_index: first_index - 1,
            offsets: Vec::new(),
            term_runs: Vec::new(),
            len_bytes: 0,
            sealed: false,
        })
    }

    /// Rebuild a segment's index by reading its records.
    ///
    /// For the open segment a torn trailing record is discarded by
    /// truncating the file; a sealed segment must parse completely.
    pub fn scan(dir: &Path, name: SegmentName) -> Result<Self> {
        let (path, sealed) = match name {
            SegmentName::Open { first } => (open_segment_path(dir, first), false),
            SegmentName::Closed { first, last } => (closed_segment_path(dir, first, last), true),
        };
        let first_index = name.first();
        let file_label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);
        let mut offsets = Vec::new();
        let mut term_runs: Vec<(u64, u64)> = Vec::new();
        let mut offset = 0u64;
        let mut next_index = first_index;

        loop {
            match LogEntry::read_record(&mut reader, &file_label, offset) {
                Ok(None) => break,
                Ok(Some((entry, record_len))) => {
                    if entry.index != next_index {
                        return Err(Error::CorruptRecord {
                            file: file_label,
                            offset,
                        });
                    }
                    if term_runs.last().map(|r| r.1) != Some(entry.term) {
                        term_runs.push((entry.index, entry.term));
                    }
                    offsets.push(offset);
                    offset += record_len;
                    next_index += 1;
                }
                Err(err) => {
                    if sealed {
                        return Err(err);
                    }
                    // Torn tail of the active segment from a crash mid-append.
                    warn!(
                        "Log: discarding torn record in {} at offset {}",
                        file_label, offset
                    );
                    OpenOptions::new().write(true).open(&path)?.set_len(offset)?;
                    break;
                }
            }
        }

        let last_index = first_index + offsets.len() as u64 - 1;
        if let SegmentName::Closed { last, .. } = name {
            if last_index != last {
                return Err(Error::CorruptRecord {
                    file: file_label,
                    offset,
                });
            }
        }

        debug!(
            "Log: scanned {} ({} entries, {} bytes)",
            file_label,
            offsets.len(),
            offset
        );
        Ok(Self {
            path,
            first_index,
            last_index,
            offsets,
            term_runs,
            len_bytes: offset,
            sealed,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.first_index && index <= self.last_index
    }

    fn offset_of(&self, index: u64) -> u64 {
        self.offsets[(index - self.first_index) as usize]
    }

    /// Read entries in `[from, to]` (inclusive, clamped to this segment).
    pub fn read_range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        let from = from.max(self.first_index);
        let to = to.min(self.last_index);
        if from > to {
            return Ok(Vec::new());
        }

        let file_label = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut file = File::open(&self.path)?;
        let mut offset = self.offset_of(from);
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(file);

        let mut entries = Vec::with_capacity((to - from + 1) as usize);
        for index in from..=to {
            match LogEntry::read_record(&mut reader, &file_label, offset)? {
                Some((entry, record_len)) if entry.index == index => {
                    entries.push(entry);
                    offset += record_len;
                }
                _ => {
                    return Err(Error::CorruptRecord {
                        file: file_label,
                        offset,
                    })
                }
            }
        }
        Ok(entries)
    }

    /// Account for a record the caller just wrote through its own handle.
    pub fn note_appended(&mut self, record_len: u64, term: u64) {
        if self.term_runs.last().map(|r| r.1) != Some(term) {
            self.term_runs.push((self.last_index + 1, term));
        }
        self.offsets.push(self.len_bytes);
        self.len_bytes += record_len;
        self.last_index += 1;
    }

    /// Term of the entry at `index`, if this segment holds it.
    pub fn term_of(&self, index: u64) -> Option<u64> {
        if !self.contains(index) {
            return None;
        }
        let run = self.term_runs.partition_point(|r| r.0 <= index);
        Some(self.term_runs[run - 1].1)
    }

    /// Seal: rename to the closed form encoding `[first,last]`.
    pub fn seal(&mut self, dir: &Path) -> Result<()> {
        let closed = closed_segment_path(dir, self.first_index, self.last_index);
        std::fs::rename(&self.path, &closed)?;
        self.path = closed;
        self.sealed = true;
        debug!(
            "Log: sealed segment [{}, {}]",
            self.first_index, self.last_index
        );
        Ok(())
    }

    /// Drop all records after `keep_last`, truncating the file in place.
    pub fn truncate_to(&mut self, keep_last: u64) -> Result<()> {
        if keep_last >= self.last_index {
            return Ok(());
        }
        let new_len = if keep_last < self.first_index {
            0
        } else {
            self.offset_of(keep_last + 1)
        };
        OpenOptions::new()
            .write(true)
            .open(&self.path)?
            .set_len(new_len)?;
        self.offsets
            .truncate(keep_last.saturating_sub(self.first_index - 1) as usize);
        self.term_runs.retain(|r| r.0 <= keep_last);
        self.len_bytes = new_len;
        self.last_index = keep_last.max(self.first_index - 1);
        Ok(())
    }

    /// Open the file for appending at its current end.
    pub fn writer(&self) -> Result<File> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(file)
    }
}

/// Names of every segment in `dir`, sorted by first index.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentName>> {
    let mut names = Vec::new();
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let file_name = dirent.file_name();
        if let Some(name) = SegmentName::parse(&file_name.to_string_lossy()) {
            names.push(name);
        }
    }
    names.sort_by_key(|n| n.first());
    Ok(names)
}
