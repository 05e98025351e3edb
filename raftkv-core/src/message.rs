//! Wire protocol between nodes and from clients.
//!
//! Requests and responses are bincode-framed; the transport prefixes each
//! frame with a u32 length. Field order is therefore part of the protocol
//! and must stay stable across a cluster.

use crate::log::{EntryKind, LogEntry};
use crate::snapshot::SnapshotMetadata;
use crate::types::{Configuration, NodeId, Peer, ResultCode};
use serde::{Deserialize, Serialize};

/// Candidate solicitation, for both pre-vote probes and real elections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
    /// Pre-vote probes do not bump terms and are not recorded as votes.
    pub is_pre_vote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    /// Empty for a heartbeat.
    pub entries: Vec<LogEntry>,
    pub commit_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub result: ResultCode,
    /// On failure, the follower's hint for where the leader should back up
    /// to; on success, the follower's last log index.
    pub last_log_index: u64,
}

/// One chunk of a streamed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub snapshot_meta: SnapshotMetadata,
    /// Path of the data file this chunk belongs to, relative to `data/`.
    pub file_name: String,
    pub offset: u64,
    pub data: Vec<u8>,
    pub is_first: bool,
    pub is_last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub result: ResultCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub data: Vec<u8>,
    pub kind: EntryKind,
}

/// Every RPC a node serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
    GetLeader,
    GetConfiguration,
    GetLeaderCommitIndex,
    Replicate(ReplicateRequest),
    AddPeers(Vec<Peer>),
    RemovePeers(Vec<NodeId>),
    Read { key: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
    GetLeader {
        result: ResultCode,
        leader: Option<Peer>,
    },
    GetConfiguration {
        result: ResultCode,
        configuration: Configuration,
    },
    GetLeaderCommitIndex {
        result: ResultCode,
        commit_index: u64,
    },
    Replicate {
        result: ResultCode,
        index: u64,
    },
    AddPeers {
        result: ResultCode,
    },
    RemovePeers {
        result: ResultCode,
    },
    Read {
        result: ResultCode,
        value: Option<Vec<u8>>,
    },
}

impl Request {
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl Response {
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
