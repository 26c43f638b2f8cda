use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::raft::node::RaftNode;
use crate::raft::state::{Command, NodeState};

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

impl<C: Command> RaftNode<C> {
    /// Arm a fresh election timer. Any previously armed timer sees the bumped
    /// generation on its next tick and exits.
    pub(crate) fn spawn_election_timer(self: &Arc<Self>, generation: u64) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.run_election_timer(generation).await;
        });
    }

    async fn run_election_timer(self: Arc<Self>, generation: u64) {
        let timeout = self.config.election_timeout();
        let term_started = self.state.lock().await.current_term;
        tracing::debug!(
            node_id = self.id,
            term = term_started,
            timeout_ms = timeout.as_millis() as u64,
            "Election timer started"
        );

        let mut ticker = tokio::time::interval(self.config.election_tick());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let mut state = self.state.lock().await;
            if !matches!(state.role, NodeState::Follower | NodeState::Candidate) {
                tracing::debug!(node_id = self.id, role = %state.role, "Election timer exiting");
                return;
            }
            if state.current_term != term_started || state.timer_generation != generation {
                tracing::debug!(
                    node_id = self.id,
                    term_started,
                    term = state.current_term,
                    "Election timer superseded"
                );
                return;
            }
            let elapsed = state.election_reset_event.elapsed();
            if elapsed >= timeout {
                tracing::info!(
                    node_id = self.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Election timeout, starting election"
                );
                self.start_election(&mut state);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::raft::rpc::{RaftRequest, RaftResponse};
    use crate::raft::state::{NodeId, RaftState};
    use crate::transport::{Transport, TransportError};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Every peer is down; counts attempts.
    #[derive(Default)]
    struct DeadPeers {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport<String> for DeadPeers {
        async fn call(
            &self,
            peer_id: NodeId,
            _request: RaftRequest<String>,
        ) -> Result<RaftResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Unreachable(peer_id))
        }
    }

    /// Start a node with a short timeout, apply `change` once its timer is
    /// running, and report (term, role, outbound calls) after the timeout has passed.
    async fn run_timer_with(
        change: impl FnOnce(&mut RaftState<String>),
    ) -> (u64, NodeState, usize) {
        let mut config = NodeConfig::new(1, SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_peer(2, "stub-2".to_string());
        config.election_timeout_min_ms = 60;
        config.election_timeout_max_ms = 80;
        config.election_tick_ms = 5;
        config.heartbeat_interval_ms = 20;

        let peers = Arc::new(DeadPeers::default());
        let (commit_tx, _commit_rx) = mpsc::channel(8);
        let node = RaftNode::<String>::new(config, peers.clone(), commit_tx).unwrap();
        node.start().await;

        // Let the timer record the term it was armed in
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let mut state = node.state.lock().await;
            change(&mut *state);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = node.state.lock().await;
        let outcome = (state.current_term, state.role, peers.calls.load(Ordering::SeqCst));
        drop(state);
        node.stop().await;
        outcome
    }

    #[tokio::test]
    async fn expired_timer_starts_an_election() {
        let (term, role, calls) = run_timer_with(|_| {}).await;
        assert!(term >= 1);
        assert_eq!(role, NodeState::Candidate);
        assert!(calls > 0);
    }

    #[tokio::test]
    async fn timer_exits_when_term_changes() {
        let (term, role, calls) = run_timer_with(|state| state.current_term = 7).await;
        assert_eq!(term, 7);
        assert_eq!(role, NodeState::Follower);
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn timer_exits_when_superseded() {
        let (term, role, calls) = run_timer_with(|state| state.timer_generation += 1).await;
        assert_eq!(term, 0);
        assert_eq!(role, NodeState::Follower);
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn timer_exits_when_leading() {
        let (term, role, calls) = run_timer_with(|state| state.role = NodeState::Leader).await;
        assert_eq!(term, 0);
        assert_eq!(role, NodeState::Leader);
        assert_eq!(calls, 0);
    }

    #[test]
    fn timeout_within_bounds() {
        for _ in 0..200 {
            let t = random_election_timeout(150, 300);
            assert!(t >= Duration::from_millis(150));
            assert!(t <= Duration::from_millis(300));
        }
    }

    #[test]
    fn degenerate_window_is_fixed() {
        assert_eq!(random_election_timeout(200, 200), Duration::from_millis(200));
    }
}
