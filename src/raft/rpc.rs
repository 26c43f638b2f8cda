use serde::{Deserialize, Serialize};

use crate::raft::state::{LogEntry, LogIndex, NodeId, NodeState, RaftState, Term};

pub const REQUEST_VOTE_METHOD: &str = "ConsensusModule.RequestVote";
pub const APPEND_ENTRIES_METHOD: &str = "ConsensusModule.AppendEntries";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: Option<LogIndex>,
    pub last_log_term: Option<Term>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs<C> {
    pub term: Term,
    pub leader_id: NodeId,
    /// `None` means "no prior entry required".
    pub prev_log_index: Option<LogIndex>,
    pub prev_log_term: Option<Term>,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: Option<LogIndex>,
}

impl<C> AppendEntriesArgs<C> {
    /// Index of the last entry this call asks the receiver to hold.
    pub fn last_new_index(&self) -> Option<LogIndex> {
        match (self.prev_log_index, self.entries.len() as LogIndex) {
            (prev, 0) => prev,
            (None, n) => Some(n - 1),
            (Some(prev), n) => Some(prev + n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
}

/// An outbound call: the method is implied by the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest<C> {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs<C>),
}

impl<C> RaftRequest<C> {
    pub fn method(&self) -> &'static str {
        match self {
            RaftRequest::RequestVote(_) => REQUEST_VOTE_METHOD,
            RaftRequest::AppendEntries(_) => APPEND_ENTRIES_METHOD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
}

/// Handle RequestVote RPC
pub fn handle_request_vote<C: Clone>(
    state: &mut RaftState<C>,
    req: &RequestVoteArgs,
    my_id: NodeId,
) -> RequestVoteReply {
    if state.role == NodeState::Stopped {
        return RequestVoteReply {
            term: state.current_term,
            vote_granted: false,
        };
    }

    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        tracing::debug!(node_id = my_id, term = req.term, "Term out of date in RequestVote");
        state.become_follower(req.term);
    }

    let vote_granted = if req.term != state.current_term {
        // Stale candidate
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        // Candidate's log is not up-to-date
        false
    } else {
        state.voted_for = Some(req.candidate_id);
        state.election_reset_event = tokio::time::Instant::now();
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    RequestVoteReply {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle AppendEntries RPC
pub fn handle_append_entries<C: Clone>(
    state: &mut RaftState<C>,
    req: &AppendEntriesArgs<C>,
    my_id: NodeId,
) -> AppendEntriesReply {
    if state.role == NodeState::Stopped {
        return AppendEntriesReply {
            term: state.current_term,
            success: false,
        };
    }

    // If request term is greater, update our term and become follower
    if req.term > state.current_term {
        tracing::debug!(node_id = my_id, term = req.term, "Term out of date in AppendEntries");
        state.become_follower(req.term);
    }

    // Reject if request term is less than our current term
    if req.term < state.current_term {
        return AppendEntriesReply {
            term: state.current_term,
            success: false,
        };
    }

    // Valid AppendEntries from leader - reset to follower if we're a candidate
    if state.role != NodeState::Follower {
        state.become_follower(req.term);
    }
    state.election_reset_event = tokio::time::Instant::now();
    state.leader_id = Some(req.leader_id);

    if !state.matches_prev(req.prev_log_index, req.prev_log_term) {
        tracing::debug!(
            node_id = my_id,
            prev_log_index = ?req.prev_log_index,
            prev_log_term = ?req.prev_log_term,
            log_len = state.log.len(),
            "AppendEntries rejected, log mismatch"
        );
        return AppendEntriesReply {
            term: state.current_term,
            success: false,
        };
    }

    if state.append_from(req.prev_log_index, &req.entries) {
        tracing::debug!(
            node_id = my_id,
            entries = req.entries.len(),
            log_len = state.log.len(),
            "Appended entries"
        );
    }

    if state.advance_follower_commit(req.leader_commit, req.last_new_index()) {
        tracing::debug!(node_id = my_id, commit_index = ?state.commit_index, "Follower commit index advanced");
    }

    AppendEntriesReply {
        term: state.current_term,
        success: true,
    }
}
