//! Leader-side replication: heartbeats, batched entry shipping, next/match
//! bookkeeping, and snapshot streaming to peers whose needed prefix has
//! been compacted away.
//!
//! The scheduler wakes on every keepalive tick and on every local append.
//! Each peer is driven by at most one in-flight task at a time; the task
//! keeps shipping until the peer is caught up or an RPC fails, then hands
//! the peer back to the scheduler.

use super::{PeerProgress, RaftNode};
use crate::error::{Error, Result};
use crate::message::{
    AppendEntriesRequest, InstallSnapshotRequest, Request, Response,
};
use crate::snapshot::{SnapshotMetadata, SnapshotStore};
use crate::types::{NodeId, ResultCode, Role};
use std::io::Read;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub(super) async fn run_replication(node: Arc<RaftNode>) {
    let mut shutdown = node.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(node.config.keepalive_period) => {}
            _ = node.replicate_kick.notified() => {}
            _ = shutdown.changed() => return,
        }

        let peers: Vec<(NodeId, String)> = {
            let mut state = node.state.lock().await;
            if state.role != Role::Leader {
                continue;
            }
            state
                .progress
                .iter_mut()
                .filter(|(_, pr)| !pr.in_flight)
                .map(|(id, pr)| {
                    pr.in_flight = true;
                    (*id, pr.addr.clone())
                })
                .collect()
        };

        for (peer_id, addr) in peers {
            tokio::spawn(replicate_to_peer(Arc::clone(&node), peer_id, addr));
        }
    }
}

/// What the next exchange with a peer should be.
enum Plan {
    Entries(AppendEntriesRequest),
    /// The peer's next index predates our first; it needs the snapshot.
    Snapshot(SnapshotMetadata),
    Done,
}

async fn replicate_to_peer(node: Arc<RaftNode>, peer_id: NodeId, addr: String) {
    loop {
        let plan = {
            let mut state = node.state.lock().await;
            match plan_for_peer(&node, &mut state, peer_id) {
                Ok(plan) => plan,
                Err(err) => {
                    warn!("Node {}: planning for peer {}: {}", node.id, peer_id, err);
                    Plan::Done
                }
            }
        };

        let keep_going = match plan {
            Plan::Done => false,
            Plan::Entries(request) => ship_entries(&node, peer_id, &addr, request).await,
            Plan::Snapshot(meta) => ship_snapshot(&node, peer_id, &addr, meta).await,
        };
        if !keep_going {
            break;
        }
    }

    let mut state = node.state.lock().await;
    if let Some(pr) = state.progress.get_mut(&peer_id) {
        pr.in_flight = false;
    }
}

fn plan_for_peer(node: &RaftNode, state: &mut super::NodeState, peer_id: NodeId) -> Result<Plan> {
    if state.role != Role::Leader {
        return Ok(Plan::Done);
    }
    let Some(pr) = state.progress.get(&peer_id) else {
        return Ok(Plan::Done);
    };

    if pr.next_index < state.log.first_index() {
        // The prefix this peer needs is gone; only the snapshot can help.
        let meta = node
            .snapshots
            .metadata()
            .ok_or(Error::Snapshot("compacted log but no snapshot".into()))?;
        return Ok(Plan::Snapshot(meta));
    }

    let prev_log_index = pr.next_index - 1;
    let prev_log_term = state
        .log
        .get_entry_term(prev_log_index)
        .ok_or(Error::Rejected("prev term unavailable"))?;
    let last = state
        .log
        .last_index()
        .min(pr.next_index + node.config.max_entry_batch_size as u64 - 1);
    let entries = state.log.read_range(pr.next_index, last)?;

    Ok(Plan::Entries(AppendEntriesRequest {
        term: state.log.current_term(),
        leader_id: node.id,
        prev_log_index,
        prev_log_term,
        entries,
        commit_index: state.log.commit_index(),
    }))
}

/// Send one AppendEntries exchange. Returns whether the caller should plan
/// another round immediately.
async fn ship_entries(
    node: &Arc<RaftNode>,
    peer_id: NodeId,
    addr: &str,
    request: AppendEntriesRequest,
) -> bool {
    let shipped_through = request.prev_log_index + request.entries.len() as u64;
    let had_entries = !request.entries.is_empty();
    let sent_term = request.term;

    let response = match timeout(
        node.config.keepalive_period.max(node.config.vote_timeout),
        node.transport.send(addr, Request::AppendEntries(request)),
    )
    .await
    {
        Ok(Ok(Response::AppendEntries(resp))) => resp,
        Ok(Ok(_)) => {
            warn!("Node {}: peer {} sent a mismatched response", node.id, peer_id);
            return false;
        }
        Ok(Err(err)) => {
            // Transient: the next scheduler tick retries.
            debug!("Node {}: append to {} failed: {}", node.id, peer_id, err);
            return false;
        }
        Err(_) => {
            debug!("Node {}: append to {} timed out", node.id, peer_id);
            return false;
        }
    };

    let mut state = node.state.lock().await;
    if response.term > state.log.current_term() {
        if let Err(err) = node.step_down(&mut state, response.term) {
            node.fatal("metadata", &err);
        }
        return false;
    }
    if state.role != Role::Leader || state.log.current_term() != sent_term {
        return false;
    }
    let last_index = state.log.last_index();
    let Some(pr) = state.progress.get_mut(&peer_id) else {
        return false;
    };

    if response.result == ResultCode::Success {
        pr.match_index = pr.match_index.max(shipped_through);
        pr.next_index = shipped_through + 1;
        let match_index = pr.match_index;
        let caught_up = mark_caught_up(&node.config, last_index, pr);
        node.progress_tx.send_modify(|gen| *gen += 1);
        if caught_up {
            info!("Node {}: peer {} caught up", node.id, peer_id);
        }
        if let Err(err) = node.advance_commit(&mut state) {
            node.fatal("metadata", &err);
            return false;
        }
        // Keep shipping while the peer is behind.
        had_entries && match_index < state.log.last_index()
    } else {
        // Follower hint: back next_index up, bounded below by what we know
        // is replicated and above by one step of progress.
        let floor = pr.match_index + 1;
        let ceiling = pr.next_index.saturating_sub(1).max(floor);
        pr.next_index = (response.last_log_index + 1).clamp(floor, ceiling);
        debug!(
            "Node {}: peer {} rejected, next_index now {}",
            node.id, peer_id, pr.next_index
        );
        true
    }
}

fn mark_caught_up(config: &crate::config::RaftConfig, last_index: u64, pr: &mut PeerProgress) -> bool {
    if !pr.is_caught_up && last_index.saturating_sub(pr.match_index) <= config.catchup_margin {
        pr.is_caught_up = true;
        return true;
    }
    false
}

/// Stream the current snapshot to a lagging peer in fixed-size chunks.
/// Returns whether the caller should plan another round.
async fn ship_snapshot(
    node: &Arc<RaftNode>,
    peer_id: NodeId,
    addr: &str,
    meta: SnapshotMetadata,
) -> bool {
    {
        let mut state = node.state.lock().await;
        let Some(pr) = state.progress.get_mut(&peer_id) else {
            return false;
        };
        pr.is_installing_snapshot = true;
    }
    info!(
        "Node {}: streaming snapshot (through {}) to peer {}",
        node.id, meta.last_included_index, peer_id
    );

    let result = stream_chunks(node, addr, &meta).await;

    let mut state = node.state.lock().await;
    if let Some(pr) = state.progress.get_mut(&peer_id) {
        pr.is_installing_snapshot = false;
    }
    match result {
        Ok(()) => {
            if let Some(pr) = state.progress.get_mut(&peer_id) {
                pr.match_index = pr.match_index.max(meta.last_included_index);
                pr.next_index = meta.last_included_index + 1;
            }
            node.progress_tx.send_modify(|gen| *gen += 1);
            if let Err(err) = node.advance_commit(&mut state) {
                node.fatal("metadata", &err);
                return false;
            }
            true
        }
        Err(err) => {
            warn!(
                "Node {}: snapshot stream to {} aborted: {}",
                node.id, peer_id, err
            );
            false
        }
    }
}

async fn stream_chunks(node: &Arc<RaftNode>, addr: &str, meta: &SnapshotMetadata) -> Result<()> {
    // Open every data file up front: renames from a concurrent local
    // snapshot swap cannot invalidate handles already held.
    let dir = node
        .snapshots
        .current_dir()
        .ok_or(Error::Snapshot("no snapshot directory".into()))?;
    let files = SnapshotStore::open_data_files(&dir)?;
    let chunk_size = node.config.snapshot_chunk_size;
    let deadline = node.config.keepalive_period.max(node.config.vote_timeout);

    let term = {
        let state = node.state.lock().await;
        if state.role != Role::Leader {
            return Err(Error::Rejected("lost leadership"));
        }
        state.log.current_term()
    };

    // Pre-compute sizes so the final chunk can be tagged is_last.
    let mut sized = Vec::with_capacity(files.len());
    for (name, file) in files {
        let len = file.metadata()?.len();
        sized.push((name, file, len));
    }

    let mut is_first = true;
    let total = sized.len();
    for (file_pos, (name, mut file, len)) in sized.into_iter().enumerate() {
        let mut offset = 0u64;
        loop {
            let mut data = vec![0u8; chunk_size];
            let read = file.read(&mut data)?;
            data.truncate(read);

            let at_file_end = offset + read as u64 >= len || read == 0;
            let is_last = at_file_end && file_pos + 1 == total;
            let request = InstallSnapshotRequest {
                term,
                leader_id: node.id,
                snapshot_meta: meta.clone(),
                file_name: name.clone(),
                offset,
                data,
                is_first,
                is_last,
            };
            is_first = false;

            let response = timeout(
                deadline,
                node.transport.send(addr, Request::InstallSnapshot(request)),
            )
            .await
            .map_err(|_| Error::transport(addr, "snapshot chunk deadline"))??;
            match response {
                Response::InstallSnapshot(resp) => {
                    if resp.term > term {
                        let mut state = node.state.lock().await;
                        node.step_down(&mut state, resp.term)?;
                        return Err(Error::Rejected("higher term during snapshot"));
                    }
                    if resp.result != ResultCode::Success {
                        return Err(Error::Snapshot("receiver refused chunk".into()));
                    }
                }
                _ => return Err(Error::Rejected("unexpected response")),
            }

            offset += read as u64;
            if at_file_end {
                break;
            }
        }
    }

    // A snapshot with no data files still needs its metadata delivered.
    if total == 0 {
        let request = InstallSnapshotRequest {
            term,
            leader_id: node.id,
            snapshot_meta: meta.clone(),
            file_name: String::new(),
            offset: 0,
            data: Vec::new(),
            is_first: true,
            is_last: true,
        };
        let response = timeout(
            deadline,
            node.transport.send(addr, Request::InstallSnapshot(request)),
        )
        .await
        .map_err(|_| Error::transport(addr, "snapshot chunk deadline"))??;
        match response {
            Response::InstallSnapshot(resp) if resp.result == ResultCode::Success => {}
            _ => return Err(Error::Snapshot("receiver refused chunk".into())),
        }
    }

    Ok(())
}
