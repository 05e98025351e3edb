//! Replicated key-value store core.
//!
//! A leader-based consensus engine (Raft) over a segmented append-only
//! log, with snapshot compaction and transfer, single-server membership
//! changes, and linearizable reads via the read-index handshake. The state
//! machine is pluggable; a reference key-value implementation is included.

pub mod client;
pub mod config;
pub mod error;
pub mod kv;
pub mod log;
pub mod message;
pub mod node;
pub mod service;
pub mod snapshot;
pub mod state_machine;
pub mod transport;
pub mod types;

pub use client::RaftClient;
pub use config::RaftConfig;
pub use error::{Error, Result};
pub use kv::{KvCommand, KvStateMachine};
pub use node::RaftNode;
pub use service::Service;
pub use state_machine::StateMachine;
pub use types::{Configuration, NodeId, Peer, ResultCode, Role};
