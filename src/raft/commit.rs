use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::raft::state::{Command, CommitEntry, NodeId, RaftState};

/// Republishes newly committed entries, in index order, on the delivery channel.
///
/// Signals carry no payload and may be coalesced: each wakeup re-reads
/// `commit_index`/`last_applied` under the node lock.
pub struct CommitSender<C: Command> {
    node_id: NodeId,
    state: Arc<Mutex<RaftState<C>>>,
    ready_rx: mpsc::Receiver<()>,
    commit_tx: mpsc::Sender<CommitEntry<C>>,
}

impl<C: Command> CommitSender<C> {
    pub fn new(
        node_id: NodeId,
        state: Arc<Mutex<RaftState<C>>>,
        ready_rx: mpsc::Receiver<()>,
        commit_tx: mpsc::Sender<CommitEntry<C>>,
    ) -> Self {
        Self {
            node_id,
            state,
            ready_rx,
            commit_tx,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = self.ready_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }

            let entries = self.state.lock().await.take_committed();
            if entries.is_empty() {
                continue;
            }
            tracing::debug!(
                node_id = self.node_id,
                first = entries[0].index,
                count = entries.len(),
                "Delivering committed entries"
            );

            for entry in entries {
                tracing::trace!(node_id = self.node_id, index = entry.index, term = entry.term, "New commit");
                if self.commit_tx.send(entry).await.is_err() {
                    tracing::warn!(node_id = self.node_id, "Commit channel closed, stopping delivery");
                    return;
                }
            }
        }
        tracing::debug!(node_id = self.node_id, "Commit sender stopped");
    }
}
