//! Background snapshot creation.
//!
//! On every backup interval the snapshotter checks whether the log has
//! outgrown the configured threshold and, if so, asks the state machine
//! for a snapshot and truncates the superseded log prefix. Suppressed
//! entirely while an install transfer holds the store.

use super::RaftNode;
use crate::error::{Error, Result};
use crate::snapshot::{SnapshotMetadata, SnapshotStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(super) async fn run_snapshotter(node: Arc<RaftNode>) {
    let mut shutdown = node.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(node.config.backup_interval) => {}
            _ = shutdown.changed() => return,
        }

        let wanted = {
            let state = node.state.lock().await;
            let compacted_through = node
                .snapshots
                .metadata()
                .map(|m| m.last_included_index)
                .unwrap_or(0);
            state.log.size_bytes() >= node.config.snapshot_min_log_size
                && state.last_applied > compacted_through
        };
        if !wanted {
            continue;
        }
        if !node.snapshots.try_begin_take() {
            debug!("Node {}: snapshot deferred, store busy", node.id);
            continue;
        }

        let result = take_snapshot(&node).await;
        node.snapshots.end_take();
        if let Err(err) = result {
            warn!("Node {}: snapshot failed: {}", node.id, err);
            node.snapshots.abort_pending();
        }
    }
}

/// Write a snapshot of everything applied so far and compact the log.
///
/// Holding the state-machine lock for the whole write keeps the apply loop
/// out, so the data written corresponds exactly to `last_applied` as
/// captured. The engine lock itself is only taken for the bookkeeping
/// before and after the write.
pub(crate) async fn take_snapshot(node: &Arc<RaftNode>) -> Result<()> {
    let _sm = node.sm_lock.lock().await;

    let (target, target_term, configuration) = {
        let state = node.state.lock().await;
        let target = state.last_applied;
        if target == 0 {
            return Ok(());
        }
        let target_term = state
            .log
            .get_entry_term(target)
            .ok_or(Error::Snapshot("applied entry already compacted".into()))?;
        (target, target_term, state.configuration.clone())
    };

    let old_dir = node.snapshots.current_dir();
    let pending = node.snapshots.begin_pending()?;
    node.state_machine
        .write_snapshot(old_dir.as_deref(), &pending, target)?;
    SnapshotStore::update_meta(
        &pending,
        &SnapshotMetadata {
            last_included_index: target,
            last_included_term: target_term,
            configuration,
        },
    )?;
    node.snapshots.commit_pending()?;
    drop(_sm);

    let mut state = node.state.lock().await;
    state.log.set_snapshot_boundary(target, target_term);
    state.log.truncate_prefix(target + 1)?;
    info!(
        "Node {}: snapshot sealed through index {} (term {})",
        node.id, target, target_term
    );
    Ok(())
}
