//! The consensus node: role and term bookkeeping, the engine lock, RPC
//! handlers, the apply loop, and the background schedulers.
//!
//! One coarse mutex (the engine lock) serializes every role transition,
//! term change, local log append, commit-index update and membership
//! change. Watch channels broadcast commit-index and last-applied advances
//! to waiters (synchronous writers, read-index reads); a notify kicks the
//! replication scheduler when new entries are appended.

mod election;
mod membership;
mod replication;
mod snapshotter;

use crate::config::RaftConfig;
use crate::error::{Error, Result};
use crate::log::{EntryKind, LogEntry, LogOptions, SegmentedLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Request, RequestVoteRequest, RequestVoteResponse, Response,
};
use crate::snapshot::SnapshotStore;
use crate::state_machine::StateMachine;
use crate::transport::Transport;
use crate::types::{Configuration, NodeId, Peer, ResultCode, Role};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// Leader-side replication bookkeeping for one peer.
#[derive(Debug, Clone)]
pub(crate) struct PeerProgress {
    pub addr: String,
    /// Next entry to send.
    pub next_index: u64,
    /// Highest index known replicated on the peer.
    pub match_index: u64,
    /// Gate for membership changes: a joining peer counts for a
    /// CONFIGURATION proposal only once it has caught up.
    pub is_caught_up: bool,
    pub is_installing_snapshot: bool,
    /// A replication task currently owns this peer.
    pub in_flight: bool,
}

impl PeerProgress {
    fn new(addr: String, next_index: u64, caught_up: bool) -> Self {
        Self {
            addr,
            next_index,
            match_index: 0,
            is_caught_up: caught_up,
            is_installing_snapshot: false,
            in_flight: false,
        }
    }
}

/// Everything guarded by the engine lock.
pub(crate) struct NodeState {
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub log: SegmentedLog,
    pub configuration: Configuration,
    pub last_applied: u64,
    /// Configured members (minus self) plus joining learners.
    pub progress: HashMap<NodeId, PeerProgress>,
    pub election_deadline: Instant,
}

impl NodeState {
    pub fn reset_election_deadline(&mut self, config: &RaftConfig) {
        use rand::Rng;
        let base = config.vote_timeout;
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
        self.election_deadline = Instant::now() + base + std::time::Duration::from_millis(jitter);
    }

    /// Addr for `id`: configured endpoint, or the learner's registration.
    pub fn addr_of(&self, id: NodeId) -> Option<String> {
        self.configuration
            .peer(id)
            .map(|p| p.addr.clone())
            .or_else(|| self.progress.get(&id).map(|p| p.addr.clone()))
    }
}

pub struct RaftNode {
    pub(crate) id: NodeId,
    pub(crate) config: RaftConfig,
    pub(crate) state: Mutex<NodeState>,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) state_machine: Arc<dyn StateMachine>,
    /// Serializes state-machine calls: the apply loop vs the snapshotter.
    pub(crate) sm_lock: Mutex<()>,
    pub(crate) transport: Arc<dyn Transport>,
    /// Signaled with the new commit index whenever it advances.
    pub(crate) commit_tx: watch::Sender<u64>,
    /// Signaled with the new last-applied index after each apply.
    pub(crate) apply_tx: watch::Sender<u64>,
    /// Generation counter bumped whenever any peer's match index moves.
    pub(crate) progress_tx: watch::Sender<u64>,
    /// Wakes the replication scheduler ahead of its next tick.
    pub(crate) replicate_kick: Notify,
    /// Serializes membership changes.
    pub(crate) membership_lock: Mutex<()>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

impl RaftNode {
    /// Recover durable state, wire the state machine, and start the
    /// background tasks (election timer, replication scheduler, apply
    /// loop, snapshotter).
    pub async fn start(
        id: NodeId,
        config: RaftConfig,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let snapshots = SnapshotStore::open(&config.data_dir)?;
        let mut log = SegmentedLog::open(
            &config.log_dir(),
            LogOptions {
                max_segment_bytes: config.max_segment_file_size,
                sync_on_append: !config.async_write,
            },
        )?;

        // A snapshot supersedes both the startup membership list and the
        // compacted log prefix.
        let mut configuration = Configuration::new(config.peers.clone());
        let mut last_applied = 0;
        if let Some(meta) = snapshots.metadata() {
            log.set_snapshot_boundary(meta.last_included_index, meta.last_included_term);
            state_machine.read_snapshot(&config.snapshot_dir())?;
            configuration = meta.configuration;
            last_applied = meta.last_included_index;
        }

        let commit_index = log.commit_index();
        let mut state = NodeState {
            role: Role::Follower,
            leader_id: None,
            log,
            configuration,
            last_applied,
            progress: HashMap::new(),
            election_deadline: Instant::now(),
        };
        state.reset_election_deadline(&config);

        let (commit_tx, _) = watch::channel(commit_index);
        let (apply_tx, _) = watch::channel(last_applied);
        let (progress_tx, _) = watch::channel(0);
        let (shutdown_tx, _) = watch::channel(false);

        let node = Arc::new(Self {
            id,
            config,
            state: Mutex::new(state),
            snapshots,
            state_machine,
            sm_lock: Mutex::new(()),
            transport,
            commit_tx,
            apply_tx,
            progress_tx,
            replicate_kick: Notify::new(),
            membership_lock: Mutex::new(()),
            shutdown_tx,
        });

        info!("Node {}: started (commit={})", id, commit_index);
        tokio::spawn(election::run_election_timer(Arc::clone(&node)));
        tokio::spawn(replication::run_replication(Arc::clone(&node)));
        tokio::spawn(snapshotter::run_snapshotter(Arc::clone(&node)));
        tokio::spawn(Arc::clone(&node).run_apply());
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Stop all background tasks. In-flight RPC handlers finish normally.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A log I/O failure means this node can no longer uphold durability;
    /// stop driving the protocol so a restart can recover from disk.
    pub(crate) fn fatal(&self, context: &str, err: &Error) {
        error!("Node {}: fatal {} failure: {}", self.id, context, err);
        self.shutdown();
    }

    // ---- observers ---------------------------------------------------

    pub async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    pub async fn current_term(&self) -> u64 {
        self.state.lock().await.log.current_term()
    }

    pub async fn commit_index(&self) -> u64 {
        self.state.lock().await.log.commit_index()
    }

    pub async fn last_applied(&self) -> u64 {
        self.state.lock().await.last_applied
    }

    pub async fn leader(&self) -> Option<Peer> {
        let state = self.state.lock().await;
        let id = state.leader_id?;
        state.configuration.peer(id).cloned()
    }

    pub async fn first_log_index(&self) -> u64 {
        self.state.lock().await.log.first_index()
    }

    pub async fn last_log_index(&self) -> u64 {
        self.state.lock().await.log.last_index()
    }

    pub fn snapshot_metadata(&self) -> Option<crate::snapshot::SnapshotMetadata> {
        self.snapshots.metadata()
    }

    pub async fn configuration(&self) -> Configuration {
        self.state.lock().await.configuration.clone()
    }

    // ---- role transitions --------------------------------------------

    /// Adopt `term` (persisting it, clearing any vote) and fall back to
    /// follower. Persists before any response carrying the term leaves.
    pub(crate) fn step_down(&self, state: &mut NodeState, term: u64) -> Result<()> {
        let old_role = state.role;
        if term > state.log.current_term() {
            state.log.update_meta(|m| {
                m.current_term = term;
                m.voted_for = None;
            })?;
        }
        state.role = Role::Follower;
        if old_role != Role::Follower {
            info!(
                "Node {}: stepped down from {:?} (term {})",
                self.id, old_role, term
            );
            state.leader_id = None;
        }
        state.reset_election_deadline(&self.config);
        Ok(())
    }

    /// Leader commit rule: advance to the highest index replicated on a
    /// quorum of the configuration, provided that entry is from the
    /// current term.
    pub(crate) fn advance_commit(&self, state: &mut NodeState) -> Result<()> {
        if state.role != Role::Leader {
            return Ok(());
        }

        let mut matches: Vec<u64> = state
            .configuration
            .peers
            .iter()
            .map(|p| {
                if p.id == self.id {
                    state.log.last_index()
                } else {
                    state
                        .progress
                        .get(&p.id)
                        .map(|pr| pr.match_index)
                        .unwrap_or(0)
                }
            })
            .collect();
        let quorum = state.configuration.quorum();
        if matches.len() < quorum {
            return Ok(());
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[quorum - 1];

        if candidate > state.log.commit_index()
            && state.log.get_entry_term(candidate) == Some(state.log.current_term())
        {
            state.log.update_meta(|m| m.commit_index = candidate)?;
            self.commit_tx.send_replace(candidate);
            debug!("Node {}: commit index -> {}", self.id, candidate);
        }
        Ok(())
    }

    // ---- RequestVote -------------------------------------------------

    pub(crate) async fn handle_request_vote(
        &self,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse {
        let mut state = self.state.lock().await;
        let reject = |state: &NodeState| RequestVoteResponse {
            term: state.log.current_term(),
            granted: false,
        };

        if !state.configuration.is_empty() && !state.configuration.contains(req.candidate_id) {
            warn!(
                "Node {}: vote request from non-member {}",
                self.id, req.candidate_id
            );
            return reject(&state);
        }

        if !req.is_pre_vote && req.term > state.log.current_term() {
            if let Err(err) = self.step_down(&mut state, req.term) {
                self.fatal("metadata", &err);
                return reject(&state);
            }
        }
        if req.term < state.log.current_term() {
            return reject(&state);
        }

        // Up-to-date check: (lastLogTerm, lastLogIndex), lexicographic.
        let log_ok = (req.last_log_term, req.last_log_index)
            >= (state.log.last_term(), state.log.last_index());

        if req.is_pre_vote {
            // No term bump, no recorded vote, no timer reset.
            return RequestVoteResponse {
                term: state.log.current_term(),
                granted: log_ok,
            };
        }

        let can_vote = state.log.voted_for().is_none()
            || state.log.voted_for() == Some(req.candidate_id);
        let granted = can_vote && log_ok;
        if granted {
            // The vote must be durable before the response leaves.
            if let Err(err) = state.log.update_meta(|m| m.voted_for = Some(req.candidate_id)) {
                self.fatal("metadata", &err);
                return reject(&state);
            }
            state.reset_election_deadline(&self.config);
            info!(
                "Node {}: granted vote to {} for term {}",
                self.id, req.candidate_id, req.term
            );
        } else {
            debug!(
                "Node {}: rejected vote for {} (can_vote={}, log_ok={})",
                self.id, req.candidate_id, can_vote, log_ok
            );
        }
        RequestVoteResponse {
            term: state.log.current_term(),
            granted,
        }
    }

    // ---- AppendEntries -----------------------------------------------

    pub(crate) async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        let mut state = self.state.lock().await;
        match self.append_entries_locked(&mut state, req) {
            Ok(resp) => resp,
            Err(err) => {
                self.fatal("log append", &err);
                AppendEntriesResponse {
                    term: state.log.current_term(),
                    result: ResultCode::Fail,
                    last_log_index: state.log.last_index(),
                }
            }
        }
    }

    fn append_entries_locked(
        &self,
        state: &mut NodeState,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let fail = |state: &NodeState, hint: u64| AppendEntriesResponse {
            term: state.log.current_term(),
            result: ResultCode::Fail,
            last_log_index: hint,
        };

        if req.term < state.log.current_term() {
            return Ok(fail(state, state.log.last_index()));
        }
        if !state.configuration.is_empty() && !state.configuration.contains(req.leader_id) {
            warn!(
                "Node {}: AppendEntries from non-member {}",
                self.id, req.leader_id
            );
            return Ok(fail(state, state.log.last_index()));
        }

        if req.term > state.log.current_term() {
            self.step_down(state, req.term)?;
        } else if state.role == Role::Leader
            || (state.leader_id.is_some() && state.leader_id != Some(req.leader_id))
        {
            // A second server claims leadership for this term. Bump our
            // own term so the cluster converges through a fresh election.
            let next_term = state.log.current_term() + 1;
            warn!(
                "Node {}: dueling leader {} in term {}, forcing term {}",
                self.id,
                req.leader_id,
                req.term,
                next_term
            );
            self.step_down(state, next_term)?;
            return Ok(fail(state, state.log.last_index()));
        } else if state.role == Role::Candidate {
            state.role = Role::Follower;
        }

        state.leader_id = Some(req.leader_id);
        state.reset_election_deadline(&self.config);

        // Consistency check at prev_log_index.
        if req.prev_log_index > state.log.last_index() {
            debug!(
                "Node {}: gap at {} (log ends at {})",
                self.id,
                req.prev_log_index,
                state.log.last_index()
            );
            return Ok(fail(state, state.log.last_index()));
        }
        if req.prev_log_index > 0 {
            if let Some(local_term) = state.log.get_entry_term(req.prev_log_index) {
                if local_term != req.prev_log_term {
                    debug!(
                        "Node {}: term mismatch at {} (have {}, want {})",
                        self.id, req.prev_log_index, local_term, req.prev_log_term
                    );
                    return Ok(fail(state, req.prev_log_index.saturating_sub(1)));
                }
            }
            // A prev inside the compacted prefix is committed state and
            // matches by construction.
        }

        // Skip entries we already hold; on the first conflict truncate the
        // suffix and append from there.
        let entry_count = req.entries.len() as u64;
        let mut start = req.entries.len();
        for (i, entry) in req.entries.iter().enumerate() {
            if entry.index < state.log.first_index() {
                continue;
            }
            if entry.index <= state.log.last_index() {
                if state.log.get_entry_term(entry.index) == Some(entry.term) {
                    continue;
                }
                state.log.truncate_suffix(entry.index - 1)?;
            }
            start = i;
            break;
        }
        if start < req.entries.len() {
            state.log.append(&req.entries[start..])?;
        }

        // Follower commit: bounded by what this request proved we share.
        let proven = req.prev_log_index + entry_count;
        let new_commit = req.commit_index.min(proven).max(state.log.commit_index());
        if new_commit > state.log.commit_index() {
            state.log.update_meta(|m| m.commit_index = new_commit)?;
            self.commit_tx.send_replace(new_commit);
        }

        Ok(AppendEntriesResponse {
            term: state.log.current_term(),
            result: ResultCode::Success,
            last_log_index: state.log.last_index(),
        })
    }

    // ---- InstallSnapshot (receiver side) ----------------------------

    pub(crate) async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        match self.install_snapshot_inner(req).await {
            Ok(term) => InstallSnapshotResponse {
                term,
                result: ResultCode::Success,
            },
            Err((term, err)) => {
                warn!("Node {}: snapshot install failed: {}", self.id, err);
                self.snapshots.abort_install();
                InstallSnapshotResponse {
                    term,
                    result: ResultCode::Fail,
                }
            }
        }
    }

    async fn install_snapshot_inner(
        &self,
        req: InstallSnapshotRequest,
    ) -> std::result::Result<u64, (u64, Error)> {
        let term = {
            let mut state = self.state.lock().await;
            let current = state.log.current_term();
            if req.term < current {
                return Err((current, Error::Rejected("stale term")));
            }
            if req.term > current {
                self.step_down(&mut state, req.term)
                    .map_err(|e| (current, e))?;
            } else if state.role != Role::Follower {
                self.step_down(&mut state, req.term)
                    .map_err(|e| (current, e))?;
            }
            state.leader_id = Some(req.leader_id);
            state.reset_election_deadline(&self.config);
            state.log.current_term()
        };

        if req.is_first {
            self.snapshots
                .begin_install(req.snapshot_meta.clone())
                .map_err(|e| (term, e))?;
        }
        if !req.file_name.is_empty() {
            self.snapshots
                .install_chunk(&req.snapshot_meta, &req.file_name, req.offset, &req.data)
                .map_err(|e| (term, e))?;
        }
        if !req.is_last {
            return Ok(term);
        }

        // Final chunk: swap the staging tree in, restore the state
        // machine, and discard the superseded log prefix.
        let stale = {
            let state = self.state.lock().await;
            req.snapshot_meta.last_included_index <= state.last_applied
        };
        if stale {
            self.snapshots.abort_install();
            return Ok(term);
        }

        let meta = self.snapshots.finish_install().map_err(|e| (term, e))?;
        {
            let _sm = self.sm_lock.lock().await;
            self.state_machine
                .read_snapshot(&self.config.snapshot_dir())
                .map_err(|e| (term, e))?;
        }

        let mut state = self.state.lock().await;
        state.configuration = meta.configuration.clone();
        state
            .log
            .set_snapshot_boundary(meta.last_included_index, meta.last_included_term);
        state
            .log
            .truncate_prefix(meta.last_included_index + 1)
            .map_err(|e| (term, e))?;
        if meta.last_included_index > state.log.commit_index() {
            state
                .log
                .update_meta(|m| m.commit_index = meta.last_included_index)
                .map_err(|e| (term, e))?;
            self.commit_tx.send_replace(meta.last_included_index);
        }
        state.last_applied = meta.last_included_index;
        self.apply_tx.send_replace(meta.last_included_index);
        info!(
            "Node {}: installed snapshot through index {}",
            self.id, meta.last_included_index
        );
        Ok(term)
    }

    // ---- apply loop --------------------------------------------------

    async fn run_apply(self: Arc<Self>) {
        let mut commit_rx = self.commit_tx.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if let Err(err) = self.apply_ready().await {
                error!("Node {}: apply loop stopped: {}", self.id, err);
                self.shutdown();
                return;
            }
            tokio::select! {
                _ = commit_rx.changed() => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Feed every committed-but-unapplied entry to the state machine, in
    /// order. CONFIGURATION entries take effect here, upon apply.
    async fn apply_ready(&self) -> Result<()> {
        loop {
            let entry = {
                let state = self.state.lock().await;
                if state.last_applied >= state.log.commit_index() {
                    return Ok(());
                }
                let index = state.last_applied + 1;
                match state.log.get_entry(index)? {
                    Some(entry) => entry,
                    // Compacted past us by a snapshot install racing ahead.
                    None => return Ok(()),
                }
            };

            if entry.kind == EntryKind::Data {
                let _sm = self.sm_lock.lock().await;
                self.state_machine.apply(&entry.data)?;
            }

            let mut state = self.state.lock().await;
            if state.last_applied >= entry.index {
                // A snapshot install advanced past this entry meanwhile.
                continue;
            }
            if entry.kind == EntryKind::Configuration {
                self.apply_configuration(&mut state, &entry)?;
            }
            state.last_applied = entry.index;
            self.apply_tx.send_replace(entry.index);
        }
    }

    fn apply_configuration(&self, state: &mut NodeState, entry: &LogEntry) -> Result<()> {
        let new_config = Configuration::decode(&entry.data)?;
        info!(
            "Node {}: configuration now {:?} (index {})",
            self.id,
            new_config.peers.iter().map(|p| p.id).collect::<Vec<_>>(),
            entry.index
        );

        // Close links to members that just left, and stop tracking them.
        for peer in state.configuration.peers.clone() {
            if !new_config.contains(peer.id) {
                self.transport.close(&peer.addr);
                state.progress.remove(&peer.id);
            }
        }
        state.configuration = new_config.clone();

        if state.role == Role::Leader {
            // Joining members already have learner progress; make sure
            // every member is tracked.
            let next = state.log.last_index() + 1;
            for peer in new_config.others(self.id) {
                state
                    .progress
                    .entry(peer.id)
                    .or_insert_with(|| PeerProgress::new(peer.addr.clone(), next, true));
            }
            if !new_config.contains(self.id) {
                // We removed ourselves; relinquish leadership now that the
                // entry is applied.
                info!("Node {}: removed from configuration, stepping down", self.id);
                state.role = Role::Follower;
                state.leader_id = None;
                state.reset_election_deadline(&self.config);
            }
        }
        Ok(())
    }

    // ---- client-facing operations ------------------------------------

    /// Append a client entry and replicate it.
    ///
    /// Synchronous mode resolves once the entry commits (or errors on
    /// timeout); asynchronous mode resolves after the local durable
    /// append, which is the weaker guarantee.
    pub async fn replicate(&self, data: Vec<u8>, kind: EntryKind) -> Result<u64> {
        let index = self.append_local(data, kind).await?;
        if self.config.async_write {
            return Ok(index);
        }
        self.wait_for_commit(index).await?;
        Ok(index)
    }

    /// Synchronous replicate regardless of the async-write mode; used for
    /// CONFIGURATION entries, which always wait for commit.
    pub(crate) async fn replicate_sync(&self, data: Vec<u8>, kind: EntryKind) -> Result<u64> {
        let index = self.append_local(data, kind).await?;
        self.wait_for_commit(index).await?;
        Ok(index)
    }

    async fn append_local(&self, data: Vec<u8>, kind: EntryKind) -> Result<u64> {
        let index = {
            let mut state = self.state.lock().await;
            if state.role != Role::Leader {
                return Err(Error::NotLeader(state.leader_id));
            }
            let index = state.log.last_index() + 1;
            let entry = LogEntry::new(index, state.log.current_term(), kind, data);
            if let Err(err) = state.log.append(&[entry]) {
                self.fatal("log append", &err);
                return Err(err);
            }
            // A single-node cluster commits on its own append.
            self.advance_commit(&mut state)?;
            index
        };
        self.replicate_kick.notify_waiters();
        Ok(index)
    }

    /// Wait until `index` commits and verify the committed entry is ours
    /// (a newer leader may have overwritten it).
    async fn wait_for_commit(&self, index: u64) -> Result<()> {
        let term = {
            let state = self.state.lock().await;
            match state.log.get_entry_term(index) {
                Some(term) => term,
                None => return Err(Error::Rejected("entry vanished before commit")),
            }
        };

        let mut commit_rx = self.commit_tx.subscribe();
        let wait = async {
            while *commit_rx.borrow() < index {
                if commit_rx.changed().await.is_err() {
                    return Err(Error::Shutdown);
                }
            }
            Ok(())
        };
        tokio::time::timeout(self.config.max_await_timeout, wait)
            .await
            .map_err(|_| Error::Timeout("commit"))??;

        let state = self.state.lock().await;
        if state.log.get_entry_term(index) == Some(term) {
            Ok(())
        } else {
            Err(Error::Rejected("entry overwritten before commit"))
        }
    }

    /// Read-index read: settle on a commit index, wait until the local
    /// apply catches up to it, then read the state machine.
    pub async fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let read_index = {
            let state = self.state.lock().await;
            if state.role == Role::Leader {
                Some(state.log.commit_index())
            } else {
                None
            }
        };

        let read_index = match read_index {
            Some(index) => index,
            None => self.fetch_leader_commit_index().await?,
        };

        let mut apply_rx = self.apply_tx.subscribe();
        let wait = async {
            while *apply_rx.borrow() < read_index {
                if apply_rx.changed().await.is_err() {
                    return Err(Error::Shutdown);
                }
            }
            Ok(())
        };
        tokio::time::timeout(self.config.max_await_timeout, wait)
            .await
            .map_err(|_| Error::Timeout("read-index apply"))??;

        self.state_machine.get(key)
    }

    /// One RPC to the leader for its commit index.
    async fn fetch_leader_commit_index(&self) -> Result<u64> {
        let leader_addr = {
            let state = self.state.lock().await;
            state
                .leader_id
                .and_then(|id| state.addr_of(id))
                .ok_or(Error::NotLeader(None))?
        };

        let response = self
            .transport
            .send(&leader_addr, Request::GetLeaderCommitIndex)
            .await?;
        match response {
            Response::GetLeaderCommitIndex {
                result: ResultCode::Success,
                commit_index,
            } => Ok(commit_index),
            Response::GetLeaderCommitIndex { .. } => Err(Error::NotLeader(None)),
            _ => Err(Error::Rejected("unexpected response")),
        }
    }

    /// Leader's commit index for follower read-index reads.
    pub async fn leader_commit_index(&self) -> Result<u64> {
        let state = self.state.lock().await;
        if state.role != Role::Leader {
            return Err(Error::NotLeader(state.leader_id));
        }
        Ok(state.log.commit_index())
    }

    pub async fn add_peers(&self, peers: Vec<Peer>) -> Result<()> {
        membership::add_peers(self, peers).await
    }

    pub async fn remove_peers(&self, ids: Vec<NodeId>) -> Result<()> {
        membership::remove_peers(self, ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvCommand, KvStateMachine};
    use crate::service::Service;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestNode {
        node: Arc<RaftNode>,
        _dir: TempDir,
    }

    /// A node whose peers are unreachable, with a long election timer so
    /// handler tests stay deterministic.
    async fn isolated_node(id: NodeId) -> TestNode {
        let dir = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let config = RaftConfig {
            data_dir: dir.path().to_path_buf(),
            peers: vec![
                Peer::new(1, "n1"),
                Peer::new(2, "n2"),
                Peer::new(3, "n3"),
            ],
            vote_timeout: Duration::from_secs(60),
            keepalive_period: Duration::from_millis(20),
            max_await_timeout: Duration::from_millis(500),
            ..RaftConfig::default()
        };
        let node = RaftNode::start(
            id,
            config,
            Arc::new(KvStateMachine::new()),
            net.transport(format!("n{id}")),
        )
        .await
        .unwrap();
        TestNode { node, _dir: dir }
    }

    fn vote_req(term: u64, candidate: NodeId, last_index: u64, last_term: u64, pre: bool) -> RequestVoteRequest {
        RequestVoteRequest {
            term,
            candidate_id: candidate,
            last_log_index: last_index,
            last_log_term: last_term,
            is_pre_vote: pre,
        }
    }

    fn data_entry(index: u64, term: u64) -> LogEntry {
        let cmd = KvCommand::put(format!("k{index}"), format!("v{index}-t{term}"));
        LogEntry::new(index, term, EntryKind::Data, cmd.encode().unwrap())
    }

    fn append_req(
        term: u64,
        leader: NodeId,
        prev: (u64, u64),
        entries: Vec<LogEntry>,
        commit: u64,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: leader,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            commit_index: commit,
        }
    }

    #[tokio::test]
    async fn grants_first_vote_and_persists_it() {
        let t = isolated_node(1).await;

        let resp = t.node.handle_request_vote(vote_req(1, 2, 0, 0, false)).await;
        assert!(resp.granted);
        assert_eq!(t.node.current_term().await, 1);

        // Same term, different candidate: already voted.
        let resp = t.node.handle_request_vote(vote_req(1, 3, 0, 0, false)).await;
        assert!(!resp.granted);

        // Same candidate again: idempotent grant.
        let resp = t.node.handle_request_vote(vote_req(1, 2, 0, 0, false)).await;
        assert!(resp.granted);
    }

    #[tokio::test]
    async fn rejects_stale_term_and_outdated_log() {
        let t = isolated_node(1).await;
        t.node
            .handle_append_entries(append_req(2, 2, (0, 0), vec![data_entry(1, 2)], 0))
            .await;

        // Stale term.
        let resp = t.node.handle_request_vote(vote_req(1, 3, 5, 1, false)).await;
        assert!(!resp.granted);

        // Candidate log behind ours: (term 2, index 1) vs candidate (1, 5).
        let resp = t.node.handle_request_vote(vote_req(3, 3, 5, 1, false)).await;
        assert!(!resp.granted);

        // Up-to-date candidate wins the vote.
        let resp = t.node.handle_request_vote(vote_req(3, 3, 1, 2, false)).await;
        assert!(resp.granted);
    }

    #[tokio::test]
    async fn pre_vote_changes_nothing() {
        let t = isolated_node(1).await;

        let resp = t.node.handle_request_vote(vote_req(5, 2, 0, 0, true)).await;
        assert!(resp.granted);
        // No term adoption, no recorded vote.
        assert_eq!(t.node.current_term().await, 0);

        let resp = t.node.handle_request_vote(vote_req(0, 3, 0, 0, false)).await;
        assert!(resp.granted, "pre-vote must not consume the real vote");
    }

    #[tokio::test]
    async fn vote_from_non_member_is_rejected() {
        let t = isolated_node(1).await;
        let resp = t.node.handle_request_vote(vote_req(1, 99, 0, 0, false)).await;
        assert!(!resp.granted);
    }

    #[tokio::test]
    async fn append_entries_applies_committed_data() {
        let t = isolated_node(1).await;

        let resp = t
            .node
            .handle_append_entries(append_req(
                1,
                2,
                (0, 0),
                vec![data_entry(1, 1), data_entry(2, 1), data_entry(3, 1)],
                2,
            ))
            .await;
        assert_eq!(resp.result, ResultCode::Success);
        assert_eq!(resp.last_log_index, 3);
        assert_eq!(t.node.commit_index().await, 2);

        // The apply loop feeds exactly the committed prefix.
        for _ in 0..250 {
            if t.node.last_applied().await >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(t.node.last_applied().await, 2);
    }

    #[tokio::test]
    async fn append_entries_rejects_gap_with_hint() {
        let t = isolated_node(1).await;
        t.node
            .handle_append_entries(append_req(1, 2, (0, 0), vec![data_entry(1, 1)], 0))
            .await;

        let resp = t
            .node
            .handle_append_entries(append_req(1, 2, (5, 1), vec![data_entry(6, 1)], 0))
            .await;
        assert_eq!(resp.result, ResultCode::Fail);
        assert_eq!(resp.last_log_index, 1);
    }

    #[tokio::test]
    async fn append_entries_resolves_conflicting_suffix() {
        let t = isolated_node(1).await;
        t.node
            .handle_append_entries(append_req(
                1,
                2,
                (0, 0),
                vec![data_entry(1, 1), data_entry(2, 1), data_entry(3, 1)],
                1,
            ))
            .await;

        // New leader at term 2 overwrites indices 2..3.
        let resp = t
            .node
            .handle_append_entries(append_req(
                2,
                3,
                (1, 1),
                vec![data_entry(2, 2), data_entry(3, 2)],
                1,
            ))
            .await;
        assert_eq!(resp.result, ResultCode::Success);
        assert_eq!(resp.last_log_index, 3);

        let state = t.node.state.lock().await;
        assert_eq!(state.log.get_entry_term(2), Some(2));
        assert_eq!(state.log.get_entry_term(3), Some(2));
    }

    #[tokio::test]
    async fn prev_term_mismatch_backs_leader_up() {
        let t = isolated_node(1).await;
        t.node
            .handle_append_entries(append_req(
                1,
                2,
                (0, 0),
                vec![data_entry(1, 1), data_entry(2, 1)],
                0,
            ))
            .await;

        let resp = t
            .node
            .handle_append_entries(append_req(2, 3, (2, 2), vec![data_entry(3, 2)], 0))
            .await;
        assert_eq!(resp.result, ResultCode::Fail);
        assert_eq!(resp.last_log_index, 1, "hint is prev_log_index - 1");
    }

    #[tokio::test]
    async fn dueling_leader_forces_fresh_term() {
        let t = isolated_node(1).await;
        t.node
            .handle_append_entries(append_req(3, 2, (0, 0), vec![], 0))
            .await;
        assert_eq!(t.node.current_term().await, 3);

        // Another server claims term 3 as well.
        let resp = t
            .node
            .handle_append_entries(append_req(3, 3, (0, 0), vec![], 0))
            .await;
        assert_eq!(resp.result, ResultCode::Fail);
        assert_eq!(t.node.current_term().await, 4);
    }

    #[tokio::test]
    async fn append_from_non_member_is_rejected() {
        let t = isolated_node(1).await;
        let resp = t
            .node
            .handle_append_entries(append_req(1, 99, (0, 0), vec![data_entry(1, 1)], 0))
            .await;
        assert_eq!(resp.result, ResultCode::Fail);
        assert_eq!(t.node.commit_index().await, 0);
    }

    #[tokio::test]
    async fn single_node_cluster_elects_and_commits() {
        let dir = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let config = RaftConfig {
            data_dir: dir.path().to_path_buf(),
            peers: vec![Peer::new(1, "n1")],
            vote_timeout: Duration::from_millis(50),
            keepalive_period: Duration::from_millis(20),
            max_await_timeout: Duration::from_secs(2),
            ..RaftConfig::default()
        };
        let node = RaftNode::start(
            1,
            config,
            Arc::new(KvStateMachine::new()),
            net.transport("n1"),
        )
        .await
        .unwrap();
        net.register("n1", Service::new(Arc::clone(&node)));

        for _ in 0..250 {
            if node.role().await == Role::Leader {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(node.role().await, Role::Leader);

        let cmd = KvCommand::put("hello", "world").encode().unwrap();
        let index = node.replicate(cmd, EntryKind::Data).await.unwrap();
        assert_eq!(index, 1);
        assert_eq!(node.commit_index().await, 1);

        let value = node.read(b"hello").await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"world"[..]));
    }
}
