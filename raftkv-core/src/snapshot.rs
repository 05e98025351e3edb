//! Snapshot store: the current snapshot's metadata plus the opaque data
//! tree the state machine produced, and the staging lifecycle used while a
//! new snapshot is being written or installed.
//!
//! At most one of {taking, installing} may be active on a node at any
//! moment; the engine checks both flags before starting either. A failed
//! transfer or write aborts its temporary directory and leaves the prior
//! snapshot authoritative.

use crate::error::{Error, Result};
use crate::types::Configuration;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const METADATA_FILE: &str = "metadata";
const METADATA_TMP: &str = "metadata.tmp";
const DATA_DIR: &str = "data";

/// Descriptor of the snapshot's position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Membership as of `last_included_index`.
    pub configuration: Configuration,
}

/// In-flight install transfer (follower side).
struct InstallSession {
    meta: SnapshotMetadata,
}

pub struct SnapshotStore {
    /// Canonical snapshot directory (`<data>/snapshot`).
    dir: PathBuf,
    /// Staging directory for installs (`<data>/snapshot.staging`).
    staging: PathBuf,
    /// Build directory for locally taken snapshots (`<data>/snapshot.new`).
    pending: PathBuf,
    /// Retired snapshot during the swap (`<data>/snapshot.old`).
    retired: PathBuf,
    meta: Mutex<Option<SnapshotMetadata>>,
    taking: AtomicBool,
    installing: AtomicBool,
    install: Mutex<Option<InstallSession>>,
}

impl SnapshotStore {
    /// Open the store under `data_dir`, clearing leftovers from any
    /// interrupted operation.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let store = Self {
            dir: data_dir.join("snapshot"),
            staging: data_dir.join("snapshot.staging"),
            pending: data_dir.join("snapshot.new"),
            retired: data_dir.join("snapshot.old"),
            meta: Mutex::new(None),
            taking: AtomicBool::new(false),
            installing: AtomicBool::new(false),
            install: Mutex::new(None),
        };

        fs::create_dir_all(&store.dir)?;
        for leftover in [&store.staging, &store.pending, &store.retired] {
            if leftover.exists() {
                warn!("Snapshot: removing stale {:?}", leftover);
                fs::remove_dir_all(leftover)?;
            }
        }
        store.reload()?;
        Ok(store)
    }

    /// Re-read metadata from disk; absent metadata means no snapshot.
    pub fn reload(&self) -> Result<()> {
        let path = self.dir.join(METADATA_FILE);
        let meta = if path.exists() {
            let data = fs::read_to_string(&path)?;
            Some(serde_json::from_str::<SnapshotMetadata>(&data)?)
        } else {
            None
        };
        if let Some(m) = meta.as_ref() {
            info!(
                "Snapshot: loaded (last_included={}, term={})",
                m.last_included_index, m.last_included_term
            );
        }
        *self.meta.lock().unwrap() = meta;
        Ok(())
    }

    pub fn metadata(&self) -> Option<SnapshotMetadata> {
        self.meta.lock().unwrap().clone()
    }

    /// Canonical snapshot directory, for `StateMachine::read_snapshot` and
    /// as the old-snapshot input when writing a new one.
    pub fn current_dir(&self) -> Option<PathBuf> {
        self.metadata().map(|_| self.dir.clone())
    }

    /// Write `meta` into `dir` atomically (write-temp-then-rename).
    pub fn update_meta(dir: &Path, meta: &SnapshotMetadata) -> Result<()> {
        let tmp = dir.join(METADATA_TMP);
        let path = dir.join(METADATA_FILE);
        fs::write(&tmp, serde_json::to_string_pretty(meta)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Open every file under `dir/data` in deterministic sorted order.
    ///
    /// Names are paths relative to `data/`, with `/` separators, matching
    /// the `file_name` field of InstallSnapshot chunks.
    pub fn open_data_files(dir: &Path) -> Result<Vec<(String, File)>> {
        let data_root = dir.join(DATA_DIR);
        let mut names = Vec::new();
        collect_files(&data_root, String::new(), &mut names)?;
        names.sort();

        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let file = File::open(data_root.join(&name))?;
            files.push((name, file));
        }
        Ok(files)
    }

    // ---- locally taken snapshots ------------------------------------

    /// Reserve the taking flag; refused while an install is running or
    /// another snapshot is being taken.
    pub fn try_begin_take(&self) -> bool {
        if self.installing.load(Ordering::SeqCst) {
            return false;
        }
        self.taking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_take(&self) {
        self.taking.store(false, Ordering::SeqCst);
    }

    pub fn is_taking(&self) -> bool {
        self.taking.load(Ordering::SeqCst)
    }

    pub fn is_installing(&self) -> bool {
        self.installing.load(Ordering::SeqCst)
    }

    /// Fresh build directory for a snapshot about to be written.
    pub fn begin_pending(&self) -> Result<PathBuf> {
        if self.pending.exists() {
            fs::remove_dir_all(&self.pending)?;
        }
        fs::create_dir_all(self.pending.join(DATA_DIR))?;
        Ok(self.pending.clone())
    }

    /// Atomically move a completed pending snapshot into place and reload.
    pub fn commit_pending(&self) -> Result<()> {
        self.swap_into_place(&self.pending.clone())?;
        self.reload()
    }

    pub fn abort_pending(&self) {
        if self.pending.exists() {
            let _ = fs::remove_dir_all(&self.pending);
        }
    }

    // ---- streamed installs ------------------------------------------

    /// Start an install transfer: reserve the flag and reset staging.
    pub fn begin_install(&self, meta: SnapshotMetadata) -> Result<()> {
        if self.taking.load(Ordering::SeqCst) {
            return Err(Error::SnapshotBusy);
        }
        if self
            .installing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // A previous transfer died mid-stream; restart cleanly.
            debug!("Snapshot: restarting interrupted install");
        }
        if self.staging.exists() {
            fs::remove_dir_all(&self.staging)?;
        }
        fs::create_dir_all(self.staging.join(DATA_DIR))?;
        *self.install.lock().unwrap() = Some(InstallSession { meta });
        Ok(())
    }

    /// Write one chunk at `offset` in `staging/data/<file_name>`.
    pub fn install_chunk(
        &self,
        meta: &SnapshotMetadata,
        file_name: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        {
            let session = self.install.lock().unwrap();
            let session = session.as_ref().ok_or(Error::Snapshot(
                "install chunk without an active transfer".into(),
            ))?;
            if session.meta.last_included_index != meta.last_included_index
                || session.meta.last_included_term != meta.last_included_term
            {
                return Err(Error::Snapshot("install chunk for a different snapshot".into()));
            }
        }

        let path = self.staging.join(DATA_DIR).join(file_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Seal the transfer: persist metadata into staging, swap it into the
    /// canonical location, reload. Returns the installed metadata.
    pub fn finish_install(&self) -> Result<SnapshotMetadata> {
        let meta = {
            let mut session = self.install.lock().unwrap();
            session
                .take()
                .ok_or(Error::Snapshot("finishing install without a transfer".into()))?
                .meta
        };

        Self::update_meta(&self.staging, &meta)?;
        self.swap_into_place(&self.staging.clone())?;
        self.reload()?;
        self.installing.store(false, Ordering::SeqCst);
        info!(
            "Snapshot: installed (last_included={}, term={})",
            meta.last_included_index, meta.last_included_term
        );
        Ok(meta)
    }

    /// Drop the transfer and staging directory; the prior snapshot stays.
    pub fn abort_install(&self) {
        *self.install.lock().unwrap() = None;
        if self.staging.exists() {
            let _ = fs::remove_dir_all(&self.staging);
        }
        self.installing.store(false, Ordering::SeqCst);
    }

    fn swap_into_place(&self, new_dir: &Path) -> Result<()> {
        if self.retired.exists() {
            fs::remove_dir_all(&self.retired)?;
        }
        if self.dir.exists() {
            fs::rename(&self.dir, &self.retired)?;
        }
        fs::rename(new_dir, &self.dir)?;
        if self.retired.exists() {
            fs::remove_dir_all(&self.retired)?;
        }
        Ok(())
    }
}

fn collect_files(root: &Path, prefix: String, out: &mut Vec<String>) -> Result<()> {
    let dir = root.join(&prefix);
    if !dir.exists() {
        return Ok(());
    }
    for dirent in fs::read_dir(&dir)? {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        if dirent.file_type()?.is_dir() {
            collect_files(root, rel, out)?;
        } else {
            out.push(rel);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Peer;
    use std::io::Read;
    use tempfile::tempdir;

    fn meta(index: u64, term: u64) -> SnapshotMetadata {
        SnapshotMetadata {
            last_included_index: index,
            last_included_term: term,
            configuration: Configuration::new(vec![
                Peer::new(1, "127.0.0.1:7001"),
                Peer::new(2, "127.0.0.1:7002"),
            ]),
        }
    }

    #[test]
    fn empty_store_has_no_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.metadata().is_none());
        assert!(store.current_dir().is_none());
    }

    #[test]
    fn pending_snapshot_becomes_current() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.try_begin_take());

        let pending = store.begin_pending().unwrap();
        fs::write(pending.join(DATA_DIR).join("kv"), b"state").unwrap();
        SnapshotStore::update_meta(&pending, &meta(10, 2)).unwrap();
        store.commit_pending().unwrap();
        store.end_take();

        assert_eq!(store.metadata().unwrap().last_included_index, 10);
        let current = store.current_dir().unwrap();
        assert_eq!(fs::read(current.join(DATA_DIR).join("kv")).unwrap(), b"state");
    }

    #[test]
    fn take_and_install_exclude_each_other() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        assert!(store.try_begin_take());
        assert!(store.begin_install(meta(5, 1)).is_err());
        store.end_take();

        store.begin_install(meta(5, 1)).unwrap();
        assert!(!store.try_begin_take());
        store.abort_install();
        assert!(store.try_begin_take());
        store.end_take();
    }

    #[test]
    fn chunked_install_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let m = meta(42, 3);

        store.begin_install(m.clone()).unwrap();
        store.install_chunk(&m, "kv", 0, b"hello ").unwrap();
        store.install_chunk(&m, "kv", 6, b"world").unwrap();
        store.install_chunk(&m, "nested/extra", 0, b"x").unwrap();
        let installed = store.finish_install().unwrap();

        assert_eq!(installed, m);
        assert_eq!(store.metadata().unwrap(), m);
        assert!(!store.is_installing());

        let current = store.current_dir().unwrap();
        let mut contents = String::new();
        File::open(current.join(DATA_DIR).join("kv"))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hello world");

        let files = SnapshotStore::open_data_files(&current).unwrap();
        let names: Vec<_> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["kv", "nested/extra"]);
    }

    #[test]
    fn installing_same_snapshot_twice_is_identical() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let m = meta(7, 2);

        for _ in 0..2 {
            store.begin_install(m.clone()).unwrap();
            store.install_chunk(&m, "kv", 0, b"payload").unwrap();
            store.finish_install().unwrap();
        }

        assert_eq!(store.metadata().unwrap(), m);
        let current = store.current_dir().unwrap();
        assert_eq!(fs::read(current.join(DATA_DIR).join("kv")).unwrap(), b"payload");
    }

    #[test]
    fn abort_keeps_prior_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        store.begin_install(meta(5, 1)).unwrap();
        store
            .install_chunk(&meta(5, 1), "kv", 0, b"first")
            .unwrap();
        store.finish_install().unwrap();

        store.begin_install(meta(9, 2)).unwrap();
        store
            .install_chunk(&meta(9, 2), "kv", 0, b"second")
            .unwrap();
        store.abort_install();

        assert_eq!(store.metadata().unwrap().last_included_index, 5);
        let current = store.current_dir().unwrap();
        assert_eq!(fs::read(current.join(DATA_DIR).join("kv")).unwrap(), b"first");
    }
}
