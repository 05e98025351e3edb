//! Core types shared across the engine.

use serde::{Deserialize, Serialize};

/// Unique identifier for a cluster member.
pub type NodeId = u64;

/// A cluster member: id plus the endpoint its transport listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub addr: String,
}

impl Peer {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

/// Role in the consensus cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Passive participant, accepts entries from the leader.
    Follower,
    /// Attempting to become leader.
    Candidate,
    /// Active leader, handles all client writes.
    Leader,
}

impl Default for Role {
    fn default() -> Self {
        Role::Follower
    }
}

/// Result code surfaced on client-facing RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    Fail,
    /// The request reached a non-leader; refresh the leader and retry.
    NotLeader,
}

/// The set of peers that form quorum.
///
/// Initialized from the startup member list; thereafter mutated only by
/// committed CONFIGURATION entries or during snapshot install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub peers: Vec<Peer>,
}

impl Configuration {
    pub fn new(mut peers: Vec<Peer>) -> Self {
        peers.sort_by_key(|p| p.id);
        peers.dedup_by_key(|p| p.id);
        Self { peers }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.peers.iter().any(|p| p.id == id)
    }

    pub fn peer(&self, id: NodeId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Every member except `me`.
    pub fn others(&self, me: NodeId) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(move |p| p.id != me)
    }

    /// Strict majority of the current membership.
    pub fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    /// New configuration with `peer` added (no-op if already present).
    pub fn with_peer(&self, peer: Peer) -> Self {
        let mut peers = self.peers.clone();
        if !self.contains(peer.id) {
            peers.push(peer);
            peers.sort_by_key(|p| p.id);
        }
        Self { peers }
    }

    /// New configuration with `id` removed (no-op if absent).
    pub fn without_peer(&self, id: NodeId) -> Self {
        Self {
            peers: self
                .peers
                .iter()
                .filter(|p| p.id != id)
                .cloned()
                .collect(),
        }
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ids: &[NodeId]) -> Configuration {
        Configuration::new(
            ids.iter()
                .map(|id| Peer::new(*id, format!("127.0.0.1:{}", 7000 + id)))
                .collect(),
        )
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(config(&[1]).quorum(), 1);
        assert_eq!(config(&[1, 2, 3]).quorum(), 2);
        assert_eq!(config(&[1, 2, 3, 4]).quorum(), 3);
        assert_eq!(config(&[1, 2, 3, 4, 5]).quorum(), 3);
    }

    #[test]
    fn add_and_remove_peers() {
        let base = config(&[1, 2, 3]);

        let grown = base.with_peer(Peer::new(4, "127.0.0.1:7004"));
        assert_eq!(grown.len(), 4);
        assert!(grown.contains(4));
        // Adding an existing member changes nothing.
        assert_eq!(grown.with_peer(Peer::new(4, "other")).len(), 4);

        let shrunk = grown.without_peer(1);
        assert_eq!(shrunk.len(), 3);
        assert!(!shrunk.contains(1));
    }

    #[test]
    fn configuration_roundtrip() {
        let cfg = config(&[1, 2, 3]);
        let decoded = Configuration::decode(&cfg.encode().unwrap()).unwrap();
        assert_eq!(decoded, cfg);
    }
}
