use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::commit::CommitSender;
use crate::raft::rpc::{
    handle_append_entries, handle_request_vote, AppendEntriesArgs, AppendEntriesReply,
    RaftRequest, RaftResponse, RequestVoteArgs, RequestVoteReply, APPEND_ENTRIES_METHOD,
    REQUEST_VOTE_METHOD,
};
use crate::raft::state::{
    Command, CommitEntry, LogEntry, LogIndex, NodeId, NodeState, RaftState, Term,
};
use crate::transport::{Transport, TransportError};

/// Point-in-time view of a node, for observers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub term: Term,
    pub role: NodeState,
    pub leader_id: Option<NodeId>,
    pub commit_index: Option<LogIndex>,
    pub last_applied: Option<LogIndex>,
    pub log_len: usize,
}

/// The consensus state machine of one node.
///
/// All mutable state lives in one `RaftState` behind a single lock. No
/// network call is made while holding it: outbound arguments are copied out
/// first and replies are re-validated against the current term and role.
pub struct RaftNode<C: Command> {
    pub id: NodeId,
    peer_ids: Vec<NodeId>,
    pub(crate) config: NodeConfig,
    pub(crate) state: Arc<Mutex<RaftState<C>>>,
    transport: Arc<dyn Transport<C>>,
    commit_ready_tx: mpsc::Sender<()>,
    pub(crate) shutdown: CancellationToken,
}

impl<C: Command> RaftNode<C> {
    /// Create a node in the Follower state and spawn its commit sender.
    /// Elections only begin once [`start`](Self::start) is called.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` fails validation.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport<C>>,
        commit_tx: mpsc::Sender<CommitEntry<C>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (commit_ready_tx, commit_ready_rx) = mpsc::channel(config.commit_signal_capacity.max(1));
        let state = Arc::new(Mutex::new(RaftState::new()));
        let shutdown = CancellationToken::new();

        let sender = CommitSender::new(config.node_id, Arc::clone(&state), commit_ready_rx, commit_tx);
        tokio::spawn(sender.run(shutdown.clone()));

        Ok(Arc::new(Self {
            id: config.node_id,
            peer_ids: config.peer_ids(),
            config,
            state,
            transport,
            commit_ready_tx,
            shutdown,
        }))
    }

    fn cluster_size(&self) -> usize {
        self.peer_ids.len() + 1
    }

    /// Reset the election clock and arm the first election timer.
    pub async fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.role == NodeState::Stopped {
            return;
        }
        state.election_reset_event = Instant::now();
        state.timer_generation += 1;
        let generation = state.timer_generation;
        drop(state);

        tracing::info!(node_id = self.id, peers = ?self.peer_ids, "Raft node started");
        self.spawn_election_timer(generation);
    }

    /// Move to the terminal Stopped state. Background tasks observe it and exit.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.stop();
        drop(state);
        self.shutdown.cancel();
        tracing::info!(node_id = self.id, "Raft node stopped");
    }

    /// Append `command` to the log if this node is the leader, returning its index.
    pub async fn propose(&self, command: C) -> Result<LogIndex> {
        let mut state = self.state.lock().await;
        match state.role {
            NodeState::Leader => {
                let index = state.append_entry(command);
                tracing::debug!(node_id = self.id, index, term = state.current_term, "Appended command to log");
                Ok(index)
            }
            NodeState::Stopped => Err(RaftError::Stopped(self.id)),
            NodeState::Follower | NodeState::Candidate => Err(RaftError::NotLeader(state.leader_id)),
        }
    }

    pub async fn submit(&self, command: C) -> bool {
        self.propose(command).await.is_ok()
    }

    /// Handle incoming RequestVote RPC
    pub async fn request_vote(self: &Arc<Self>, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.lock().await;
        let generation = state.timer_generation;
        let reply = handle_request_vote(&mut *state, &args, self.id);
        self.rearm_after_step_down(&state, generation);
        reply
    }

    /// Handle incoming AppendEntries RPC
    pub async fn append_entries(self: &Arc<Self>, args: AppendEntriesArgs<C>) -> AppendEntriesReply {
        let mut state = self.state.lock().await;
        let generation = state.timer_generation;
        let commit_index = state.commit_index;
        let reply = handle_append_entries(&mut *state, &args, self.id);
        self.rearm_after_step_down(&state, generation);
        if state.commit_index != commit_index {
            self.signal_commit();
        }
        reply
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.state.lock().await;
        NodeStatus {
            id: self.id,
            term: state.current_term,
            role: state.role,
            leader_id: state.leader_id,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            log_len: state.log.len(),
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == NodeState::Leader
    }

    pub async fn log_snapshot(&self) -> Vec<LogEntry<C>> {
        self.state.lock().await.log.clone()
    }

    /// An inbound handler stepped us down: the old timer is now stale.
    fn rearm_after_step_down(self: &Arc<Self>, state: &RaftState<C>, generation: u64) {
        if state.timer_generation != generation && state.role == NodeState::Follower {
            tracing::info!(node_id = self.id, term = state.current_term, "Became follower");
            self.spawn_election_timer(state.timer_generation);
        }
    }

    fn become_follower(self: &Arc<Self>, state: &mut RaftState<C>, term: Term) {
        tracing::info!(node_id = self.id, term, "Became follower");
        state.become_follower(term);
        self.spawn_election_timer(state.timer_generation);
    }

    fn signal_commit(&self) {
        // A full buffer already guarantees a pending wakeup.
        let _ = self.commit_ready_tx.try_send(());
    }

    /// Issue one outbound call under the RPC deadline.
    async fn call_peer(
        &self,
        peer_id: NodeId,
        request: RaftRequest<C>,
    ) -> std::result::Result<RaftResponse, TransportError> {
        match timeout(self.config.rpc_timeout(), self.transport.call(peer_id, request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(peer_id)),
        }
    }

    pub(crate) async fn send_request_vote(
        &self,
        peer_id: NodeId,
        args: RequestVoteArgs,
    ) -> std::result::Result<RequestVoteReply, TransportError> {
        match self.call_peer(peer_id, RaftRequest::RequestVote(args)).await? {
            RaftResponse::RequestVote(reply) => Ok(reply),
            RaftResponse::AppendEntries(_) => Err(TransportError::UnexpectedReply {
                peer_id,
                method: REQUEST_VOTE_METHOD,
            }),
        }
    }

    pub(crate) async fn send_append_entries(
        &self,
        peer_id: NodeId,
        args: AppendEntriesArgs<C>,
    ) -> std::result::Result<AppendEntriesReply, TransportError> {
        match self.call_peer(peer_id, RaftRequest::AppendEntries(args)).await? {
            RaftResponse::AppendEntries(reply) => Ok(reply),
            RaftResponse::RequestVote(_) => Err(TransportError::UnexpectedReply {
                peer_id,
                method: APPEND_ENTRIES_METHOD,
            }),
        }
    }

    /// Failed calls are message loss; the next election or heartbeat retries.
    fn log_rpc_failure(&self, peer_id: NodeId, error: &TransportError) {
        match error {
            TransportError::UnexpectedReply { method, .. } => {
                tracing::warn!(node_id = self.id, peer_id, method, error = %error, "Mismatched RPC reply");
            }
            _ => tracing::trace!(node_id = self.id, peer_id, error = %error, "RPC failed"),
        }
    }

    /// Start a new election. Called with the state lock held.
    pub(crate) fn start_election(self: &Arc<Self>, state: &mut RaftState<C>) {
        state.become_candidate(self.id);
        let saved_term = state.current_term;
        let generation = state.timer_generation;
        tracing::info!(node_id = self.id, term = saved_term, log_len = state.log.len(), "Starting election");

        if RaftState::<C>::has_quorum(state.votes_received, self.cluster_size()) {
            tracing::info!(node_id = self.id, term = saved_term, votes = state.votes_received, "Won election");
            self.start_leader(state);
            return;
        }

        let args = RequestVoteArgs {
            term: saved_term,
            candidate_id: self.id,
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
        };

        for &peer_id in &self.peer_ids {
            let node = Arc::clone(self);
            let args = args.clone();
            tokio::spawn(async move {
                tracing::debug!(node_id = node.id, peer_id, term = saved_term, "Sending RequestVote");
                match node.send_request_vote(peer_id, args).await {
                    Ok(reply) => node.handle_vote_reply(peer_id, saved_term, reply).await,
                    Err(e) => node.log_rpc_failure(peer_id, &e),
                }
            });
        }

        // Retry automatically if this election is indecisive
        self.spawn_election_timer(generation);
    }

    async fn handle_vote_reply(self: &Arc<Self>, peer_id: NodeId, saved_term: Term, reply: RequestVoteReply) {
        let mut state = self.state.lock().await;
        if state.role == NodeState::Stopped {
            return;
        }

        if reply.term > state.current_term {
            tracing::debug!(node_id = self.id, peer_id, term = reply.term, "Term out of date in RequestVote reply");
            self.become_follower(&mut state, reply.term);
            return;
        }

        if state.role != NodeState::Candidate || state.current_term != saved_term {
            tracing::debug!(
                node_id = self.id,
                peer_id,
                saved_term,
                role = %state.role,
                "Discarding stale RequestVote reply"
            );
            return;
        }

        if reply.term == saved_term && reply.vote_granted {
            state.votes_received += 1;
            tracing::debug!(node_id = self.id, peer_id, votes = state.votes_received, "Received vote");

            if RaftState::<C>::has_quorum(state.votes_received, self.cluster_size()) {
                tracing::info!(
                    node_id = self.id,
                    term = saved_term,
                    votes = state.votes_received,
                    "Won election"
                );
                self.start_leader(&mut state);
            }
        }
    }

    fn start_leader(self: &Arc<Self>, state: &mut RaftState<C>) {
        state.become_leader(self.id, &self.peer_ids);
        let term = state.current_term;
        tracing::info!(node_id = self.id, term, log_len = state.log.len(), "Became leader");

        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.run_heartbeats(term).await;
        });
    }

    /// Periodic replication cycle for the leadership of `term`.
    async fn run_heartbeats(self: Arc<Self>, term: Term) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !self.send_heartbeats(term).await {
                tracing::debug!(node_id = self.id, term, "Heartbeat loop exiting");
                return;
            }
        }
    }

    /// Send one round of AppendEntries (leader only). Returns false once this
    /// node no longer leads in `term`.
    async fn send_heartbeats(self: &Arc<Self>, term: Term) -> bool {
        let mut state = self.state.lock().await;
        if state.role != NodeState::Leader || state.current_term != term {
            return false;
        }

        // Without peers the leader alone is a majority
        if state.advance_leader_commit(&self.peer_ids) {
            tracing::debug!(node_id = self.id, commit_index = ?state.commit_index, "Leader commit index advanced");
            self.signal_commit();
        }

        for &peer_id in &self.peer_ids {
            let next_index = state
                .next_index
                .get(&peer_id)
                .copied()
                .unwrap_or(state.log.len() as LogIndex);
            let prev_log_index = next_index.checked_sub(1);
            let args = AppendEntriesArgs {
                term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term: prev_log_index.and_then(|i| state.term_at(i)),
                entries: state.entries_from(next_index),
                leader_commit: state.commit_index,
            };

            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.replicate_to(peer_id, next_index, args).await;
            });
        }
        true
    }

    async fn replicate_to(self: Arc<Self>, peer_id: NodeId, next_index: LogIndex, args: AppendEntriesArgs<C>) {
        let term = args.term;
        let sent = args.entries.len() as LogIndex;
        tracing::trace!(node_id = self.id, peer_id, next_index, entries = sent, "Sending AppendEntries");

        let reply = match self.send_append_entries(peer_id, args).await {
            Ok(reply) => reply,
            Err(e) => {
                self.log_rpc_failure(peer_id, &e);
                return;
            }
        };

        let mut state = self.state.lock().await;
        if state.role == NodeState::Stopped {
            return;
        }

        if reply.term > state.current_term {
            tracing::debug!(node_id = self.id, peer_id, term = reply.term, "Term out of date in AppendEntries reply");
            self.become_follower(&mut state, reply.term);
            return;
        }

        if state.role != NodeState::Leader || state.current_term != term || reply.term != term {
            return;
        }

        if reply.success {
            let new_next = next_index + sent;
            state.next_index.insert(peer_id, new_next);
            let matched = new_next.checked_sub(1);
            let match_index = state.match_index.entry(peer_id).or_insert(None);
            if matched > *match_index {
                *match_index = matched;
            }
            if sent > 0 {
                tracing::debug!(node_id = self.id, peer_id, next_index = new_next, match_index = ?matched, "AppendEntries accepted");
            }

            if state.advance_leader_commit(&self.peer_ids) {
                tracing::debug!(node_id = self.id, commit_index = ?state.commit_index, "Leader commit index advanced");
                self.signal_commit();
            }
        } else {
            let retry_from = next_index.saturating_sub(1);
            state.next_index.insert(peer_id, retry_from);
            tracing::debug!(node_id = self.id, peer_id, next_index = retry_from, "AppendEntries rejected, backing off");
        }
    }
}
