//! Segmented, append-only log store.
//!
//! Entries live in fixed-size segments under the log directory; the active
//! segment is sealed and a fresh one started when it outgrows
//! `max_segment_bytes`. A metadata file carries term, vote, first index and
//! commit index, replaced atomically on every update. A cold start rebuilds
//! the in-memory index from segment names and record scans, discarding a
//! torn record at the active tail.
//!
//! Any I/O failure during append is fatal to the local node: it cannot
//! safely continue without log durability.

mod entry;
mod metadata;
mod segment;

pub use entry::{EntryKind, LogEntry};
pub use metadata::LogMetadata;

use crate::error::{Error, Result};
use segment::{Segment, SegmentName};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Tuning knobs the engine derives from its `RaftConfig`.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub max_segment_bytes: u64,
    /// fsync after every append batch (off in async-write mode).
    pub sync_on_append: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            max_segment_bytes: 4 * 1024 * 1024,
            sync_on_append: true,
        }
    }
}

/// Durable ordered log with O(1) append and O(1) index lookup.
pub struct SegmentedLog {
    dir: PathBuf,
    opts: LogOptions,
    meta: LogMetadata,
    /// Sealed segments, sorted by first index; contiguous with `active`.
    sealed: Vec<Segment>,
    active: Segment,
    active_writer: File,
    /// Boundary of the compacted prefix: (last_included_index, term).
    snapshot_last_index: u64,
    snapshot_last_term: u64,
}

impl SegmentedLog {
    /// Open the store in `dir`, recovering exactly the last durable state.
    pub fn open(dir: &Path, opts: LogOptions) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let meta = LogMetadata::load(dir)?;

        let names = segment::list_segments(dir)?;
        let mut sealed = Vec::new();
        let mut active = None;
        for name in names {
            let seg = Segment::scan(dir, name)?;
            match name {
                SegmentName::Closed { .. } => sealed.push(seg),
                SegmentName::Open { .. } => active = Some(seg),
            }
        }

        // Crash window: sealed but the next active was never created.
        let active = match active {
            Some(seg) => seg,
            None => {
                let first = sealed
                    .last()
                    .map(|s: &Segment| s.last_index + 1)
                    .unwrap_or(meta.first_index);
                Segment::create_open(dir, first)?
            }
        };

        // Segments must form one contiguous range ending at the active one.
        let mut expected = sealed.first().map(|s| s.first_index).unwrap_or(active.first_index);
        for seg in sealed.iter().chain(std::iter::once(&active)) {
            if seg.first_index != expected {
                return Err(Error::CorruptRecord {
                    file: seg.path.to_string_lossy().into_owned(),
                    offset: 0,
                });
            }
            expected = seg.last_index + 1;
        }

        let active_writer = active.writer()?;
        let log = Self {
            dir: dir.to_path_buf(),
            opts,
            meta,
            sealed,
            active,
            active_writer,
            snapshot_last_index: 0,
            snapshot_last_term: 0,
        };
        info!(
            "Log: opened (first={}, last={}, term={}, commit={})",
            log.first_index(),
            log.last_index(),
            log.current_term(),
            log.commit_index()
        );
        Ok(log)
    }

    pub fn first_index(&self) -> u64 {
        self.meta.first_index
    }

    pub fn last_index(&self) -> u64 {
        self.active.last_index
    }

    pub fn current_term(&self) -> u64 {
        self.meta.current_term
    }

    pub fn voted_for(&self) -> Option<crate::types::NodeId> {
        self.meta.voted_for
    }

    pub fn commit_index(&self) -> u64 {
        self.meta.commit_index
    }

    pub fn last_term(&self) -> u64 {
        self.get_entry_term(self.last_index()).unwrap_or(0)
    }

    /// Total bytes across all segments; drives snapshot scheduling.
    pub fn size_bytes(&self) -> u64 {
        self.sealed.iter().map(|s| s.len_bytes).sum::<u64>() + self.active.len_bytes
    }

    /// Tell the log where the compacted prefix ends so term lookups keep
    /// working at the boundary.
    pub fn set_snapshot_boundary(&mut self, last_included_index: u64, last_included_term: u64) {
        self.snapshot_last_index = last_included_index;
        self.snapshot_last_term = last_included_term;
    }

    /// Append entries in order; returns the new last index.
    ///
    /// Entries must start exactly at `last_index + 1`; a gap is refused.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(self.last_index());
        }
        let start = entries[0].index;
        if start != self.last_index() + 1 {
            return Err(Error::LogGap {
                start,
                last: self.last_index(),
            });
        }

        for entry in entries {
            let record = entry.to_record()?;
            self.active_writer.write_all(&record)?;
            self.active.note_appended(record.len() as u64, entry.term);
        }
        if self.opts.sync_on_append {
            self.active_writer.sync_data()?;
        }

        if self.active.len_bytes >= self.opts.max_segment_bytes {
            self.roll_segment()?;
        }
        Ok(self.last_index())
    }

    /// Seal the active segment and start a fresh one after it.
    fn roll_segment(&mut self) -> Result<()> {
        let next_first = self.active.last_index + 1;
        self.active.seal(&self.dir)?;
        let new_active = Segment::create_open(&self.dir, next_first)?;
        let old = std::mem::replace(&mut self.active, new_active);
        self.sealed.push(old);
        self.active_writer = self.active.writer()?;
        Ok(())
    }

    /// The entry at `index`, or `None` outside `[first_index, last_index]`.
    pub fn get_entry(&self, index: u64) -> Result<Option<LogEntry>> {
        Ok(self.read_range(index, index)?.into_iter().next())
    }

    /// Entries in `[from, to]` inclusive, clamped to the stored range.
    pub fn read_range(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        let from = from.max(self.first_index());
        let to = to.min(self.last_index());
        if from > to {
            return Ok(Vec::new());
        }

        let mut entries = Vec::with_capacity((to - from + 1) as usize);
        for seg in self.sealed.iter().chain(std::iter::once(&self.active)) {
            if seg.last_index < from || seg.first_index > to {
                continue;
            }
            entries.extend(seg.read_range(from, to)?);
        }
        Ok(entries)
    }

    /// Term of the entry at `index`.
    ///
    /// Special-cased to the snapshot's last included term at the compaction
    /// boundary, and to 0 for the empty prefix before index 1.
    pub fn get_entry_term(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        if index < self.first_index() || index > self.last_index() {
            return None;
        }
        self.sealed
            .iter()
            .chain(std::iter::once(&self.active))
            .find_map(|seg| seg.term_of(index))
    }

    /// Drop all segments wholly before `new_first_index`; the log's first
    /// index advances. Used after a snapshot is sealed, or on install when
    /// the whole log is superseded.
    pub fn truncate_prefix(&mut self, new_first_index: u64) -> Result<()> {
        if new_first_index <= self.meta.first_index {
            return Ok(());
        }

        if new_first_index > self.last_index() {
            // The snapshot covers everything we have; restart the log empty.
            for seg in self.sealed.drain(..) {
                std::fs::remove_file(&seg.path)?;
            }
            std::fs::remove_file(&self.active.path)?;
            self.active = Segment::create_open(&self.dir, new_first_index)?;
            self.active_writer = self.active.writer()?;
        } else {
            let mut kept = Vec::new();
            for seg in self.sealed.drain(..) {
                if seg.last_index < new_first_index {
                    debug!(
                        "Log: dropping compacted segment [{}, {}]",
                        seg.first_index, seg.last_index
                    );
                    std::fs::remove_file(&seg.path)?;
                } else {
                    kept.push(seg);
                }
            }
            self.sealed = kept;
        }

        self.meta.first_index = new_first_index;
        self.meta.store(&self.dir)?;
        info!("Log: truncated prefix, first index now {}", new_first_index);
        Ok(())
    }

    /// Discard every entry after `keep_last_index`. Used when a leader's
    /// consistency check forces divergence resolution on a follower.
    pub fn truncate_suffix(&mut self, keep_last_index: u64) -> Result<()> {
        if keep_last_index >= self.last_index() {
            return Ok(());
        }
        if keep_last_index < self.commit_index() {
            warn!(
                "Log: refusing to truncate below commit index ({} < {})",
                keep_last_index,
                self.commit_index()
            );
            return Err(Error::Rejected("suffix truncation below commit index"));
        }

        if self.active.first_index > keep_last_index {
            // The whole active segment goes, plus any sealed segments past
            // the boundary; the one straddling it is reopened for writing.
            std::fs::remove_file(&self.active.path)?;
            while let Some(seg) = self.sealed.pop() {
                if seg.first_index > keep_last_index {
                    std::fs::remove_file(&seg.path)?;
                    continue;
                }
                let reopened = segment::open_segment_path(&self.dir, seg.first_index);
                std::fs::rename(&seg.path, &reopened)?;
                let mut seg = Segment {
                    path: reopened,
                    sealed: false,
                    ..seg
                };
                seg.truncate_to(keep_last_index)?;
                self.active = seg;
                self.active_writer = self.active.writer()?;
                info!("Log: truncated suffix, last index now {}", keep_last_index);
                return Ok(());
            }
            // Nothing left at all; restart at the boundary.
            self.active = Segment::create_open(&self.dir, keep_last_index + 1)?;
            self.active_writer = self.active.writer()?;
        } else {
            self.active.truncate_to(keep_last_index)?;
            self.active_writer = self.active.writer()?;
        }
        info!("Log: truncated suffix, last index now {}", keep_last_index);
        Ok(())
    }

    /// Atomically update any subset of the persisted metadata.
    pub fn update_meta(&mut self, update: impl FnOnce(&mut LogMetadata)) -> Result<()> {
        let mut next = self.meta.clone();
        update(&mut next);
        if next != self.meta {
            next.store(&self.dir)?;
            self.meta = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_opts() -> LogOptions {
        LogOptions {
            max_segment_bytes: 256,
            sync_on_append: false,
        }
    }

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(
            index,
            term,
            EntryKind::Data,
            format!("value-{index}").into_bytes(),
        )
    }

    fn append_n(log: &mut SegmentedLog, from: u64, to: u64, term: u64) {
        let entries: Vec<_> = (from..=to).map(|i| entry(i, term)).collect();
        log.append(&entries).unwrap();
    }

    /// Append one batch per index so segment rolling actually happens.
    fn append_each(log: &mut SegmentedLog, from: u64, to: u64, term: u64) {
        for i in from..=to {
            log.append(&[entry(i, term)]).unwrap();
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let mut log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        assert_eq!(log.last_index(), 0);

        append_n(&mut log, 1, 3, 1);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.get_entry(2).unwrap().unwrap(), entry(2, 1));
        assert!(log.get_entry(4).unwrap().is_none());
        assert!(log.get_entry(0).unwrap().is_none());
    }

    #[test]
    fn append_refuses_gaps() {
        let dir = tempdir().unwrap();
        let mut log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        append_n(&mut log, 1, 2, 1);

        let err = log.append(&[entry(5, 1)]).unwrap_err();
        assert!(matches!(err, Error::LogGap { start: 5, last: 2 }));
    }

    #[test]
    fn segments_roll_and_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
            append_n(&mut log, 1, 40, 1);
            append_n(&mut log, 41, 80, 2);
        }

        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 80);
        assert_eq!(log.get_entry(1).unwrap().unwrap(), entry(1, 1));
        assert_eq!(log.get_entry(80).unwrap().unwrap(), entry(80, 2));
        assert_eq!(log.get_entry_term(40), Some(1));
        assert_eq!(log.get_entry_term(41), Some(2));

        // More than one segment actually exists on disk.
        let segments = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|d| {
                d.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("segment-")
            })
            .count();
        assert!(segments > 1, "expected rolled segments, got {segments}");
    }

    #[test]
    fn truncate_prefix_drops_whole_segments() {
        let dir = tempdir().unwrap();
        let mut log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        append_each(&mut log, 1, 60, 1);
        let before = log.size_bytes();

        log.set_snapshot_boundary(30, 1);
        log.truncate_prefix(31).unwrap();
        assert_eq!(log.first_index(), 31);
        assert!(log.get_entry(5).unwrap().is_none());
        assert_eq!(log.get_entry_term(30), Some(1));
        assert_eq!(log.get_entry(40).unwrap().unwrap(), entry(40, 1));
        assert!(log.size_bytes() < before, "compaction frees disk space");

        // Reopen: metadata keeps the logical first index.
        drop(log);
        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        assert_eq!(log.first_index(), 31);
        assert_eq!(log.last_index(), 60);
    }

    #[test]
    fn truncate_prefix_past_end_restarts_log() {
        let dir = tempdir().unwrap();
        let mut log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        append_n(&mut log, 1, 10, 1);

        // Snapshot install superseding the entire local log.
        log.set_snapshot_boundary(100, 4);
        log.truncate_prefix(101).unwrap();
        assert_eq!(log.first_index(), 101);
        assert_eq!(log.last_index(), 100);
        assert_eq!(log.get_entry_term(100), Some(4));

        log.append(&[entry(101, 5)]).unwrap();
        assert_eq!(log.last_index(), 101);
    }

    #[test]
    fn truncate_suffix_within_active_segment() {
        let dir = tempdir().unwrap();
        let mut log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        append_n(&mut log, 1, 5, 1);

        log.truncate_suffix(3).unwrap();
        assert_eq!(log.last_index(), 3);
        assert!(log.get_entry(4).unwrap().is_none());

        // The writer stays valid after in-place truncation.
        log.append(&[entry(4, 2)]).unwrap();
        assert_eq!(log.get_entry_term(4), Some(2));
    }

    #[test]
    fn truncate_suffix_across_segments_reopens_straddler() {
        let dir = tempdir().unwrap();
        let mut log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        append_each(&mut log, 1, 80, 1);
        let cut = 20;

        log.truncate_suffix(cut).unwrap();
        assert_eq!(log.last_index(), cut);
        append_n(&mut log, cut + 1, cut + 5, 3);
        assert_eq!(log.get_entry_term(cut + 1), Some(3));

        drop(log);
        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        assert_eq!(log.last_index(), cut + 5);
        assert_eq!(log.get_entry(cut).unwrap().unwrap(), entry(cut, 1));
    }

    #[test]
    fn truncate_suffix_protects_committed_entries() {
        let dir = tempdir().unwrap();
        let mut log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        append_n(&mut log, 1, 10, 1);
        log.update_meta(|m| m.commit_index = 8).unwrap();

        assert!(log.truncate_suffix(5).is_err());
        assert_eq!(log.last_index(), 10);
    }

    #[test]
    fn metadata_updates_are_durable() {
        let dir = tempdir().unwrap();
        {
            let mut log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
            log.update_meta(|m| {
                m.current_term = 9;
                m.voted_for = Some(3);
            })
            .unwrap();
            log.update_meta(|m| m.commit_index = 4).unwrap();
        }

        let log = SegmentedLog::open(dir.path(), small_opts()).unwrap();
        assert_eq!(log.current_term(), 9);
        assert_eq!(log.voted_for(), Some(3));
        assert_eq!(log.commit_index(), 4);
    }
}
