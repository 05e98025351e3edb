//! Error taxonomy for the consensus engine.
//!
//! Log I/O failures are fatal to the local node; transport failures are
//! retried on the next scheduler tick; snapshot failures abort the current
//! operation and keep the previous snapshot authoritative.

use crate::types::NodeId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Appending entries that would leave a hole in the log.
    #[error("log gap: append starts at {start}, log ends at {last}")]
    LogGap { start: u64, last: u64 },

    /// A record whose framing or payload failed to decode.
    #[error("corrupt log record in {file} at offset {offset}")]
    CorruptRecord { file: String, offset: u64 },

    /// The request requires the leader; the hint may name it.
    #[error("not the leader (hint: {0:?})")]
    NotLeader(Option<NodeId>),

    /// A bounded wait expired before the condition held.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Peer RPC failure; retried by the replication scheduler.
    #[error("transport error talking to {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    /// Snapshot creation or installation was aborted.
    #[error("snapshot operation failed: {0}")]
    Snapshot(String),

    /// Another snapshot operation holds the store.
    #[error("snapshot operation already in progress")]
    SnapshotBusy,

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("node is shutting down")]
    Shutdown,

    /// Malformed or out-of-protocol request from a peer or client.
    #[error("rejected request: {0}")]
    Rejected(&'static str),
}

impl Error {
    pub fn transport(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Error::Transport {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }
}
