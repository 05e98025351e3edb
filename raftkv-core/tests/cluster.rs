//! End-to-end cluster scenarios over the in-process transport.
//!
//! Each test stands up a full cluster (real logs and snapshots on disk,
//! channel-routed RPCs) and drives it through elections, partitions,
//! crashes and membership changes.

use raftkv_core::transport::MemoryNetwork;
use raftkv_core::{Peer, RaftClient, RaftConfig, RaftNode, Role, Service};
use raftkv_core::{KvCommand, KvStateMachine};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const POLL: Duration = Duration::from_millis(20);
const SETTLE_ROUNDS: usize = 500; // 10 seconds of polling at most

fn addr(id: u64) -> String {
    format!("node-{id}")
}

struct Cluster {
    net: Arc<MemoryNetwork>,
    nodes: HashMap<u64, Arc<RaftNode>>,
    dir: TempDir,
    peers: Vec<Peer>,
    snapshot_min_log_size: u64,
    backup_interval: Duration,
}

impl Cluster {
    /// Cluster with snapshotting effectively disabled.
    async fn start(ids: &[u64]) -> Self {
        Self::start_tuned(ids, u64::MAX, Duration::from_secs(3600)).await
    }

    async fn start_tuned(ids: &[u64], snapshot_min_log_size: u64, backup_interval: Duration) -> Self {
        let mut cluster = Self {
            net: MemoryNetwork::new(),
            nodes: HashMap::new(),
            dir: TempDir::new().unwrap(),
            peers: ids.iter().map(|id| Peer::new(*id, addr(*id))).collect(),
            snapshot_min_log_size,
            backup_interval,
        };
        for id in ids {
            cluster.spawn_node(*id).await;
        }
        cluster
    }

    fn config(&self, id: u64) -> RaftConfig {
        RaftConfig {
            data_dir: self.dir.path().join(format!("node-{id}")),
            peers: self.peers.clone(),
            vote_timeout: Duration::from_millis(150),
            keepalive_period: Duration::from_millis(20),
            max_await_timeout: Duration::from_secs(2),
            max_segment_file_size: 2048,
            max_entry_batch_size: 16,
            catchup_margin: 8,
            snapshot_min_log_size: self.snapshot_min_log_size,
            backup_interval: self.backup_interval,
            snapshot_chunk_size: 512,
            async_write: false,
        }
    }

    /// Start (or restart, reusing the data directory) one node.
    async fn spawn_node(&mut self, id: u64) {
        let node = RaftNode::start(
            id,
            self.config(id),
            Arc::new(KvStateMachine::new()),
            self.net.transport(addr(id)),
        )
        .await
        .unwrap();
        self.net.register(addr(id), Service::new(Arc::clone(&node)));
        self.nodes.insert(id, node);
    }

    fn crash(&mut self, id: u64) {
        if let Some(node) = self.nodes.remove(&id) {
            node.shutdown();
        }
        self.net.unregister(&addr(id));
    }

    fn node(&self, id: u64) -> &Arc<RaftNode> {
        &self.nodes[&id]
    }

    /// Proxy with every configured endpoint.
    fn client(&self) -> RaftClient {
        let endpoints = self.peers.iter().map(|p| p.addr.clone()).collect();
        RaftClient::new(self.net.transport("client"), endpoints)
    }

    /// Proxy restricted to the given nodes.
    fn client_for(&self, ids: &[u64]) -> RaftClient {
        let endpoints = ids.iter().map(|id| addr(*id)).collect();
        RaftClient::new(self.net.transport("client"), endpoints)
    }

    async fn wait_for_leader(&self) -> u64 {
        self.wait_for_leader_among(&self.nodes.keys().copied().collect::<Vec<_>>())
            .await
    }

    async fn wait_for_leader_among(&self, ids: &[u64]) -> u64 {
        for _ in 0..SETTLE_ROUNDS {
            for id in ids {
                if let Some(node) = self.nodes.get(id) {
                    if node.role().await == Role::Leader {
                        return *id;
                    }
                }
            }
            tokio::time::sleep(POLL).await;
        }
        panic!("no leader elected among {ids:?}");
    }

    /// Wait for a leader whose term is beyond `term`; used after
    /// partitioning a stale leader away.
    async fn wait_for_leader_beyond(&self, term: u64, ids: &[u64]) -> u64 {
        for _ in 0..SETTLE_ROUNDS {
            for id in ids {
                if let Some(node) = self.nodes.get(id) {
                    if node.role().await == Role::Leader && node.current_term().await > term {
                        return *id;
                    }
                }
            }
            tokio::time::sleep(POLL).await;
        }
        panic!("no leader beyond term {term}");
    }

    async fn wait_applied(&self, id: u64, index: u64) {
        for _ in 0..SETTLE_ROUNDS {
            if self.node(id).last_applied().await >= index {
                return;
            }
            tokio::time::sleep(POLL).await;
        }
        panic!(
            "node {} stuck at applied={} (wanted {})",
            id,
            self.node(id).last_applied().await,
            index
        );
    }

    async fn wait_commit(&self, id: u64, index: u64) {
        for _ in 0..SETTLE_ROUNDS {
            if self.node(id).commit_index().await >= index {
                return;
            }
            tokio::time::sleep(POLL).await;
        }
        panic!("node {} never reached commit {}", id, index);
    }

    fn others(&self, id: u64) -> Vec<u64> {
        self.nodes.keys().copied().filter(|n| *n != id).collect()
    }
}

#[tokio::test]
async fn three_node_happy_path() {
    let cluster = Cluster::start(&[1, 2, 3]).await;
    cluster.wait_for_leader().await;

    let client = cluster.client();
    client.put("hello", "world").await.unwrap();

    // The write is readable through the read-index path on every node.
    for id in [1, 2, 3] {
        let value = client.get_from(&addr(id), "hello").await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"world"[..]), "node {id}");
    }
    for id in [1, 2, 3] {
        cluster.wait_commit(id, 1).await;
        assert_eq!(cluster.node(id).commit_index().await, 1, "node {id}");
    }
}

#[tokio::test]
async fn leader_crash_preserves_majority_replicated_entry() {
    let mut cluster = Cluster::start(&[1, 2, 3]).await;
    let leader = cluster.wait_for_leader().await;
    let followers = cluster.others(leader);
    let (reached, starved) = (followers[0], followers[1]);

    let client = cluster.client();
    client.put("stable", "committed").await.unwrap();
    for id in [leader, reached, starved] {
        cluster.wait_applied(id, 1).await;
    }

    // The next write only reaches one follower; that is still a majority.
    cluster.net.block_link(&addr(leader), &addr(starved));
    client.put("second", "also-committed").await.unwrap();
    cluster.wait_applied(reached, 2).await;

    // Fully isolate the leader and let it append entries that can never
    // commit, then kill it.
    cluster
        .net
        .partition(&[&addr(leader)], &[&addr(reached), &addr(starved)]);
    let doomed = Arc::clone(cluster.node(leader));
    let ghost_write = tokio::spawn(async move {
        let data = KvCommand::put("ghost", "never").encode().unwrap();
        let _ = doomed
            .replicate(data, raftkv_core::log::EntryKind::Data)
            .await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    cluster.crash(leader);
    ghost_write.abort();
    cluster.net.heal();

    // The survivor holding entry 2 must win.
    let new_leader = cluster.wait_for_leader().await;
    assert_ne!(new_leader, leader);
    let survivors = cluster.client_for(&[reached, starved]);
    assert_eq!(
        survivors.get("second").await.unwrap().as_deref(),
        Some(&b"also-committed"[..])
    );

    // The old leader restarts, truncates its uncommitted suffix, and
    // converges with the new majority.
    cluster.spawn_node(leader).await;
    survivors.put("post", "recovery").await.unwrap();
    let target = cluster.node(new_leader).last_applied().await;
    cluster.wait_applied(leader, target).await;

    let client = cluster.client();
    assert_eq!(
        client.get_from(&addr(leader), "second").await.unwrap().as_deref(),
        Some(&b"also-committed"[..])
    );
    assert_eq!(client.get_from(&addr(leader), "ghost").await.unwrap(), None);
}

#[tokio::test]
async fn offline_follower_catches_up_via_snapshot() {
    let mut cluster =
        Cluster::start_tuned(&[1, 2, 3], 4096, Duration::from_millis(100)).await;
    let leader = cluster.wait_for_leader().await;
    let victim = cluster.others(leader)[0];
    cluster.crash(victim);

    // Enough writes to roll segments past the snapshot threshold.
    let client = cluster.client();
    for i in 0..150u32 {
        client
            .put(format!("key-{i}"), format!("value-{i}"))
            .await
            .unwrap();
    }

    // The remaining majority compacts its log prefix.
    for _ in 0..SETTLE_ROUNDS {
        if cluster.node(leader).first_log_index().await > 1 {
            break;
        }
        tokio::time::sleep(POLL).await;
    }
    let first = cluster.node(leader).first_log_index().await;
    assert!(first > 1, "leader never compacted (first_index={first})");
    let snap = cluster.node(leader).snapshot_metadata().unwrap();
    assert_eq!(first, snap.last_included_index + 1);

    // The returning follower is too far behind for the log alone: it must
    // be fed the snapshot, then the remaining entries.
    cluster.spawn_node(victim).await;
    cluster.wait_applied(victim, 150).await;
    let installed = cluster.node(victim).snapshot_metadata().unwrap();
    assert!(installed.last_included_index >= snap.last_included_index);
    assert!(cluster.node(victim).first_log_index().await > 1);

    for i in (0..150u32).step_by(7) {
        let value = client
            .get_from(&addr(victim), format!("key-{i}"))
            .await
            .unwrap();
        assert_eq!(
            value.as_deref(),
            Some(format!("value-{i}").as_bytes()),
            "key-{i}"
        );
    }

    // Normal replication continues afterwards.
    client.put("after", "snapshot").await.unwrap();
    cluster.wait_applied(victim, 151).await;
    assert_eq!(
        client.get_from(&addr(victim), "after").await.unwrap().as_deref(),
        Some(&b"snapshot"[..])
    );
}

#[tokio::test]
async fn conflicting_follower_truncates_suffix() {
    let cluster = Cluster::start(&[1, 2, 3]).await;
    let old_leader = cluster.wait_for_leader().await;
    let survivors = cluster.others(old_leader);
    let old_term = cluster.node(old_leader).current_term().await;

    let client = cluster.client();
    client.put("base", "agreed").await.unwrap();
    for id in [old_leader, survivors[0], survivors[1]] {
        cluster.wait_applied(id, 1).await;
    }

    // Cut the leader off and let it accumulate a divergent suffix.
    cluster.net.partition(
        &[&addr(old_leader)],
        &[&addr(survivors[0]), &addr(survivors[1])],
    );
    let divergent: Vec<_> = (0..3)
        .map(|i| {
            let stale = Arc::clone(cluster.node(old_leader));
            tokio::spawn(async move {
                let data = KvCommand::put(format!("stale-{i}"), "doomed").encode().unwrap();
                let _ = stale
                    .replicate(data, raftkv_core::log::EntryKind::Data)
                    .await;
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(cluster.node(old_leader).last_log_index().await > 1);

    // The majority side moves on with different entries at those indices.
    let new_leader = cluster
        .wait_for_leader_beyond(old_term, &survivors)
        .await;
    let majority_client = cluster.client_for(&survivors);
    for i in 0..3 {
        majority_client
            .put(format!("fresh-{i}"), "kept")
            .await
            .unwrap();
    }
    for task in divergent {
        task.abort();
    }

    // Reunify: the stale leader must discard its suffix and adopt the
    // majority's entries.
    cluster.net.heal();
    let target = cluster.node(new_leader).last_applied().await;
    cluster.wait_applied(old_leader, target).await;

    assert_eq!(
        cluster.node(old_leader).last_log_index().await,
        cluster.node(new_leader).last_log_index().await
    );
    for i in 0..3 {
        assert_eq!(
            client
                .get_from(&addr(old_leader), format!("fresh-{i}"))
                .await
                .unwrap()
                .as_deref(),
            Some(&b"kept"[..])
        );
        assert_eq!(
            client
                .get_from(&addr(old_leader), format!("stale-{i}"))
                .await
                .unwrap(),
            None
        );
    }
}

#[tokio::test]
async fn membership_add_grows_quorum() {
    let mut cluster = Cluster::start(&[1, 2, 3]).await;
    cluster.wait_for_leader().await;

    let client = cluster.client();
    for i in 0..20u32 {
        client.put(format!("seed-{i}"), "x").await.unwrap();
    }

    // Node 4 starts knowing the full target membership; the old members
    // ignore it until the configuration entry commits.
    cluster.peers.push(Peer::new(4, addr(4)));
    cluster.spawn_node(4).await;
    client.add_peers(vec![Peer::new(4, addr(4))]).await.unwrap();

    // The change is committed; followers report it once applied.
    let mut config = client.get_configuration().await.unwrap();
    for _ in 0..SETTLE_ROUNDS {
        if config.len() == 4 {
            break;
        }
        tokio::time::sleep(POLL).await;
        config = client.get_configuration().await.unwrap();
    }
    assert_eq!(config.len(), 4);
    assert!(config.contains(4));

    // The joiner holds the whole prefix and serves reads.
    cluster.wait_applied(4, 21).await;
    assert_eq!(
        client.get_from(&addr(4), "seed-7").await.unwrap().as_deref(),
        Some(&b"x"[..])
    );

    // 3-of-4 still commits after losing one member.
    cluster.crash(1);
    let id = cluster.wait_for_leader_among(&[2, 3, 4]).await;
    let survivors = cluster.client_for(&[2, 3, 4]);
    survivors.put("after-loss", "ok").await.unwrap();
    assert!(cluster.node(id).commit_index().await >= 22);
}

#[tokio::test]
async fn membership_remove_shrinks_configuration() {
    let mut cluster = Cluster::start(&[1, 2, 3]).await;
    let leader = cluster.wait_for_leader().await;
    let removed = cluster.others(leader)[0];

    let client = cluster.client();
    client.put("before", "removal").await.unwrap();
    client.remove_peers(vec![removed]).await.unwrap();

    // The removed node may never learn of its own removal; the members
    // that remain converge on the two-peer configuration.
    let mut config = cluster.node(leader).configuration().await;
    for _ in 0..SETTLE_ROUNDS {
        if config.len() == 2 {
            break;
        }
        tokio::time::sleep(POLL).await;
        config = cluster.node(leader).configuration().await;
    }
    assert_eq!(config.len(), 2);
    assert!(!config.contains(removed));

    cluster.crash(removed);
    client.put("after", "removal").await.unwrap();
    assert_eq!(
        client.get("after").await.unwrap().as_deref(),
        Some(&b"removal"[..])
    );
}

#[tokio::test]
async fn read_index_reads_are_linearizable() {
    let cluster = Cluster::start(&[1, 2, 3]).await;
    cluster.wait_for_leader().await;

    let client = cluster.client();
    client.put("key", "v1").await.unwrap();
    client.put("key", "v2").await.unwrap();

    // After the ack of v2, every node must serve v2: the read-index
    // handshake forces lagging followers to wait for apply.
    for id in [1, 2, 3] {
        let value = client.get_from(&addr(id), "key").await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"v2"[..]), "node {id}");
    }
}

#[tokio::test]
async fn acknowledged_writes_survive_restart() {
    let mut cluster = Cluster::start(&[1, 2, 3]).await;
    let leader = cluster.wait_for_leader().await;

    let client = cluster.client();
    client.put("durable", "yes").await.unwrap();

    cluster.crash(leader);
    cluster.spawn_node(leader).await;

    // The restarted node recovered the entry from its own segmented log.
    assert!(cluster.node(leader).last_log_index().await >= 1);

    cluster.wait_for_leader().await;
    cluster.wait_applied(leader, 1).await;

    // The read-index path needs the restarted node to have heard from the
    // new leader; poll until the heartbeat lands.
    let mut value = None;
    for _ in 0..SETTLE_ROUNDS {
        if let Ok(read) = client.get_from(&addr(leader), "durable").await {
            value = read;
            break;
        }
        tokio::time::sleep(POLL).await;
    }
    assert_eq!(value.as_deref(), Some(&b"yes"[..]));
}
