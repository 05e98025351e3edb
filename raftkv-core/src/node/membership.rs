//! Single-server membership changes.
//!
//! Adding a server first ships it the log as a non-voting learner (from
//! next_index 1, so an InstallSnapshot is likely), waits until it is
//! within `catchup_margin` of the leader's last index, then commits a
//! CONFIGURATION entry with the new membership. Removal commits the
//! shrunken configuration and closes the outbound connection once applied.

use super::{PeerProgress, RaftNode};
use crate::error::{Error, Result};
use crate::log::EntryKind;
use crate::types::{Configuration, NodeId, Peer, Role};
use tracing::{info, warn};

pub(super) async fn add_peers(node: &RaftNode, peers: Vec<Peer>) -> Result<()> {
    let _serial = node.membership_lock.lock().await;
    for peer in peers {
        add_one(node, peer).await?;
    }
    Ok(())
}

pub(super) async fn remove_peers(node: &RaftNode, ids: Vec<NodeId>) -> Result<()> {
    let _serial = node.membership_lock.lock().await;
    for id in ids {
        remove_one(node, id).await?;
    }
    Ok(())
}

async fn add_one(node: &RaftNode, peer: Peer) -> Result<()> {
    // Register the learner and start shipping it the log.
    {
        let mut state = node.state.lock().await;
        if state.role != Role::Leader {
            return Err(Error::NotLeader(state.leader_id));
        }
        if state.configuration.contains(peer.id) {
            return Ok(());
        }
        state
            .progress
            .entry(peer.id)
            .or_insert_with(|| PeerProgress::new(peer.addr.clone(), 1, false));
        info!("Node {}: catching up joining peer {}", node.id, peer.id);
    }
    node.replicate_kick.notify_waiters();

    if let Err(err) = wait_caught_up(node, peer.id).await {
        // Abandon the join; drop the learner so replication stops.
        let mut state = node.state.lock().await;
        if !state.configuration.contains(peer.id) {
            state.progress.remove(&peer.id);
        }
        warn!("Node {}: joining peer {} never caught up", node.id, peer.id);
        return Err(err);
    }

    let index = propose_configuration(node, |config| config.with_peer(peer.clone())).await?;
    info!(
        "Node {}: peer {} joined (configuration entry {})",
        node.id, peer.id, index
    );
    Ok(())
}

async fn remove_one(node: &RaftNode, id: NodeId) -> Result<()> {
    {
        let state = node.state.lock().await;
        if state.role != Role::Leader {
            return Err(Error::NotLeader(state.leader_id));
        }
        if !state.configuration.contains(id) {
            return Ok(());
        }
    }

    let index = propose_configuration(node, |config| config.without_peer(id)).await?;
    info!(
        "Node {}: peer {} removed (configuration entry {})",
        node.id, id, index
    );
    // The connection close and progress teardown happen when the entry is
    // applied; a leader removing itself steps down there too.
    Ok(())
}

/// Block until the joining peer's match index is within `catchup_margin`
/// of the leader's last index, bounded by the await timeout.
async fn wait_caught_up(node: &RaftNode, id: NodeId) -> Result<()> {
    let mut progress_rx = node.progress_tx.subscribe();
    let wait = async {
        loop {
            {
                let state = node.state.lock().await;
                if state.role != Role::Leader {
                    return Err(Error::NotLeader(state.leader_id));
                }
                match state.progress.get(&id) {
                    Some(pr) if pr.is_caught_up => return Ok(()),
                    Some(_) => {}
                    None => return Err(Error::Rejected("joining peer vanished")),
                }
            }
            if progress_rx.changed().await.is_err() {
                return Err(Error::Shutdown);
            }
        }
    };
    tokio::time::timeout(node.config.max_await_timeout, wait)
        .await
        .map_err(|_| Error::Timeout("peer catch-up"))?
}

/// Append a CONFIGURATION entry derived from the current membership and
/// wait for it to commit.
async fn propose_configuration(
    node: &RaftNode,
    change: impl FnOnce(&Configuration) -> Configuration,
) -> Result<u64> {
    let data = {
        let state = node.state.lock().await;
        if state.role != Role::Leader {
            return Err(Error::NotLeader(state.leader_id));
        }
        change(&state.configuration).encode()?
    };
    node.replicate_sync(data, EntryKind::Configuration).await
}
