//! Durable log metadata.

use crate::error::Result;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

const METADATA_FILE: &str = "metadata";
const METADATA_TMP: &str = "metadata.tmp";

/// State that must survive restarts, recovered exactly as last acknowledged.
///
/// `last_index` is not persisted here; it is rebuilt by scanning segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub current_term: u64,
    /// Vote cast in `current_term`, if any.
    pub voted_for: Option<NodeId>,
    /// First index logically present in the log.
    pub first_index: u64,
    pub commit_index: u64,
}

impl Default for LogMetadata {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            first_index: 1,
            commit_index: 0,
        }
    }
}

impl LogMetadata {
    /// Load from `dir`, or defaults when no file exists yet.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Atomically replace the metadata file (write-temp-then-rename).
    pub fn store(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(METADATA_TMP);
        let path = dir.join(METADATA_FILE);

        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;

        debug!(
            "Log: stored metadata (term={}, voted_for={:?}, first={}, commit={})",
            self.current_term, self.voted_for, self.first_index, self.commit_index
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let meta = LogMetadata::load(dir.path()).unwrap();
        assert_eq!(meta, LogMetadata::default());
        assert_eq!(meta.first_index, 1);
    }

    #[test]
    fn store_and_load() {
        let dir = tempdir().unwrap();
        let meta = LogMetadata {
            current_term: 7,
            voted_for: Some(2),
            first_index: 101,
            commit_index: 180,
        };
        meta.store(dir.path()).unwrap();

        let loaded = LogMetadata::load(dir.path()).unwrap();
        assert_eq!(loaded, meta);
        // The temp file never survives a successful store.
        assert!(!dir.path().join(METADATA_TMP).exists());
    }
}
