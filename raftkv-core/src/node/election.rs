//! Leader election: the randomized timer, pre-vote probing, and the real
//! vote round.
//!
//! The timer fires at a random point in [T, 2T] after the last reset. A
//! firing node first runs a pre-vote round that bumps nothing; only a
//! pre-vote majority starts a real election with an incremented, persisted
//! term.

use super::RaftNode;
use crate::message::{Request, RequestVoteRequest, Response};
use crate::types::Role;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// One vote round's view of the node, captured under the engine lock.
struct Ballot {
    term: u64,
    last_log_index: u64,
    last_log_term: u64,
    /// (id, addr) of every other voting member.
    voters: Vec<(u64, String)>,
    quorum: usize,
}

pub(super) async fn run_election_timer(node: Arc<RaftNode>) {
    let mut shutdown = node.shutdown_tx.subscribe();
    let tick = node.config.vote_timeout / 4;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = shutdown.changed() => return,
        }

        let due = {
            let state = node.state.lock().await;
            state.role != Role::Leader
                && Instant::now() >= state.election_deadline
                && state.configuration.contains(node.id)
        };
        if due {
            if let Err(err) = run_election(&node).await {
                warn!("Node {}: election round failed: {}", node.id, err);
            }
        }
    }
}

async fn run_election(node: &Arc<RaftNode>) -> crate::Result<()> {
    // Pre-vote: probe with the current term, changing nothing locally.
    let ballot = {
        let mut state = node.state.lock().await;
        if state.role == Role::Leader || Instant::now() < state.election_deadline {
            return Ok(());
        }
        // Schedule the retry before soliciting, so a failed round backs off.
        state.reset_election_deadline(&node.config);
        Ballot {
            term: state.log.current_term(),
            last_log_index: state.log.last_index(),
            last_log_term: state.log.last_term(),
            voters: state
                .configuration
                .others(node.id)
                .map(|p| (p.id, p.addr.clone()))
                .collect(),
            quorum: state.configuration.quorum(),
        }
    };

    let (granted, max_term) = solicit(node, &ballot, true).await;
    if max_term > ballot.term {
        let mut state = node.state.lock().await;
        return node.step_down(&mut state, max_term);
    }
    if granted < ballot.quorum {
        debug!(
            "Node {}: pre-vote failed ({}/{})",
            node.id, granted, ballot.quorum
        );
        return Ok(());
    }

    // Real election: bump the term, vote for ourselves, persist both
    // before soliciting anyone.
    let ballot = {
        let mut state = node.state.lock().await;
        if state.log.current_term() != ballot.term || state.role == Role::Leader {
            return Ok(());
        }
        let term = ballot.term + 1;
        state.log.update_meta(|m| {
            m.current_term = term;
            m.voted_for = Some(node.id);
        })?;
        state.role = Role::Candidate;
        state.leader_id = None;
        info!("Node {}: starting election for term {}", node.id, term);
        Ballot { term, ..ballot }
    };

    let (granted, max_term) = solicit(node, &ballot, false).await;
    if max_term > ballot.term {
        let mut state = node.state.lock().await;
        return node.step_down(&mut state, max_term);
    }
    if granted < ballot.quorum {
        debug!(
            "Node {}: lost election for term {} ({}/{})",
            node.id, ballot.term, granted, ballot.quorum
        );
        return Ok(());
    }

    let mut state = node.state.lock().await;
    if state.role != Role::Candidate || state.log.current_term() != ballot.term {
        return Ok(());
    }
    state.role = Role::Leader;
    state.leader_id = Some(node.id);
    // Fresh bookkeeping for this leadership; any learner from an earlier
    // term is stale and its join attempt must start over.
    let next = state.log.last_index() + 1;
    let members: Vec<_> = state
        .configuration
        .others(node.id)
        .map(|p| (p.id, p.addr.clone()))
        .collect();
    state.progress.clear();
    for (id, addr) in members {
        state
            .progress
            .insert(id, super::PeerProgress::new(addr, next, true));
    }
    info!(
        "Node {}: won election for term {} ({}/{} votes)",
        node.id, ballot.term, granted, ballot.quorum
    );
    drop(state);

    // Establish authority immediately with empty AppendEntries.
    node.replicate_kick.notify_waiters();
    Ok(())
}

/// Fan the vote request out to every voter; returns (grants including our
/// own, highest term observed).
async fn solicit(node: &Arc<RaftNode>, ballot: &Ballot, pre_vote: bool) -> (usize, u64) {
    let deadline = rpc_deadline(node);
    let calls = ballot.voters.iter().map(|(id, addr)| {
        let request = Request::RequestVote(RequestVoteRequest {
            term: ballot.term,
            candidate_id: node.id,
            last_log_index: ballot.last_log_index,
            last_log_term: ballot.last_log_term,
            is_pre_vote: pre_vote,
        });
        let transport = Arc::clone(&node.transport);
        let addr = addr.clone();
        let id = *id;
        async move {
            match timeout(deadline, transport.send(&addr, request)).await {
                Ok(Ok(Response::RequestVote(resp))) => Some(resp),
                Ok(Ok(_)) => None,
                Ok(Err(err)) => {
                    debug!("vote rpc to {} failed: {}", id, err);
                    None
                }
                Err(_) => {
                    debug!("vote rpc to {} timed out", id);
                    None
                }
            }
        }
    });

    let mut granted = 1; // our own vote
    let mut max_term = ballot.term;
    for resp in join_all(calls).await.into_iter().flatten() {
        max_term = max_term.max(resp.term);
        if resp.granted {
            granted += 1;
        }
    }
    (granted, max_term)
}

fn rpc_deadline(node: &RaftNode) -> Duration {
    node.config.vote_timeout.max(node.config.keepalive_period)
}
