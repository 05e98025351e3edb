//! The contract between the consensus engine and the replicated state
//! machine it drives.

use crate::error::Result;
use std::path::Path;

/// A deterministic state machine fed by the apply loop.
///
/// The engine guarantees `apply` and `write_snapshot` are never called
/// concurrently over the same entry range, and `read_snapshot` is never
/// called concurrently with `apply`.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed DATA entry. Must be deterministic: every replica
    /// applies the same sequence and must end in the same state.
    fn apply(&self, data: &[u8]) -> Result<()>;

    /// Produce a self-contained snapshot at `new_dir` representing state
    /// after applying all entries through `last_applied`. `old_dir` is the
    /// previous snapshot, if one exists, for implementations that build
    /// incrementally. Data files go under `new_dir/data`.
    fn write_snapshot(&self, old_dir: Option<&Path>, new_dir: &Path, last_applied: u64)
        -> Result<()>;

    /// Reinitialize from a snapshot directory previously produced by
    /// `write_snapshot` (possibly on another node).
    fn read_snapshot(&self, dir: &Path) -> Result<()>;

    /// Point lookup for the read path.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}
