//! Node configuration.

use crate::types::Peer;
use std::path::PathBuf;
use std::time::Duration;

/// Startup parameters for a consensus node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Base directory for the log and snapshot stores.
    pub data_dir: PathBuf,
    /// Initial cluster membership, including this node.
    pub peers: Vec<Peer>,
    /// Log bytes accumulated before the snapshotter considers compacting.
    pub snapshot_min_log_size: u64,
    /// How often the snapshotter checks whether to compact.
    pub backup_interval: Duration,
    /// Active segment size at which it is sealed and a new one started.
    pub max_segment_file_size: u64,
    /// Maximum entries shipped in one AppendEntries batch.
    pub max_entry_batch_size: usize,
    /// A joining peer counts as caught up once its match index is within
    /// this many entries of the leader's last index.
    pub catchup_margin: u64,
    /// Bound on synchronous replicate and read-index waits.
    pub max_await_timeout: Duration,
    /// Election timer base T; the timer fires at a random point in [T, 2T].
    pub vote_timeout: Duration,
    /// Heartbeat period, and the per-RPC deadline for peer calls.
    pub keepalive_period: Duration,
    /// Acknowledge `replicate` after local durable append instead of after
    /// commit. Weaker guarantee: the entry may be lost if leadership moves
    /// before a majority holds it.
    pub async_write: bool,
    /// Bytes per InstallSnapshot chunk.
    pub snapshot_chunk_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./raftkv-data"),
            peers: Vec::new(),
            snapshot_min_log_size: 16 * 1024 * 1024,
            backup_interval: Duration::from_secs(30),
            max_segment_file_size: 4 * 1024 * 1024,
            max_entry_batch_size: 64,
            catchup_margin: 16,
            max_await_timeout: Duration::from_secs(5),
            vote_timeout: Duration::from_millis(300),
            keepalive_period: Duration::from_millis(100),
            async_write: false,
            snapshot_chunk_size: 64 * 1024,
        }
    }
}

impl RaftConfig {
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshot")
    }
}
