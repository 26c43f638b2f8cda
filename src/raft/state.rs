use std::collections::HashMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub type NodeId = u64;
pub type Term = u64;
/// Zero-based position in the replicated log.
pub type LogIndex = u64;

/// Anything that can be replicated through the log.
pub trait Command: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Command for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
    /// Terminal: the node has been shut down.
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
            NodeState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry<C> {
    pub command: C,
    pub term: Term,
}

/// Delivered once per committed index, in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry<C> {
    pub command: C,
    pub index: LogIndex,
    pub term: Term,
}

/// Consensus state of one node, guarded by a single lock in [`RaftNode`].
///
/// Term, vote and log are conceptually persistent but only ever held in
/// memory: a restarted process comes back with an empty log at term 0.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each node votes for at most one candidate per term (`voted_for`, cleared
///   only when the term changes)
/// - Candidate must receive a strict majority of votes to become leader
///
/// ## Leader Append-Only
/// A leader never overwrites or deletes entries in its log. Only
/// `append_entry()` touches the log while leading; `append_from()` runs on
/// followers reconciling with a leader.
///
/// ## Log Matching
/// `AppendEntries` is only accepted when the entry at `prev_log_index` carries
/// `prev_log_term` (`matches_prev`), and conflicting suffixes are truncated
/// before new entries are appended.
///
/// ## Leader Completeness
/// - Vote restriction: candidates must have up-to-date logs (`is_log_up_to_date`)
/// - Leaders only count replicas for entries from their current term
///
/// [`RaftNode`]: crate::raft::RaftNode
#[derive(Debug)]
pub struct RaftState<C> {
    // Persistent state
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry<C>>,

    // Volatile state on all servers
    pub role: NodeState,
    pub election_reset_event: Instant,
    pub commit_index: Option<LogIndex>,
    pub last_applied: Option<LogIndex>,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, Option<LogIndex>>,

    // Known leader (if any)
    pub leader_id: Option<NodeId>,

    // Votes received in current election (for candidates)
    pub votes_received: usize,

    /// Bumped every time an election timer is (re)armed or made irrelevant.
    pub timer_generation: u64,
}

impl<C: Clone> RaftState<C> {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            role: NodeState::Follower,
            election_reset_event: Instant::now(),
            commit_index: None,
            last_applied: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            leader_id: None,
            votes_received: 0,
            timer_generation: 0,
        }
    }

    pub fn last_log_index(&self) -> Option<LogIndex> {
        self.log.len().checked_sub(1).map(|i| i as LogIndex)
    }

    pub fn last_log_term(&self) -> Option<Term> {
        self.log.last().map(|e| e.term)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.log.get(index as usize).map(|e| e.term)
    }

    /// Get entries starting from index (inclusive)
    pub fn entries_from(&self, start_index: LogIndex) -> Vec<LogEntry<C>> {
        self.log
            .get(start_index as usize..)
            .map(<[LogEntry<C>]>::to_vec)
            .unwrap_or_default()
    }

    /// Append a new entry at the current term, returning its index
    pub fn append_entry(&mut self, command: C) -> LogIndex {
        self.log.push(LogEntry {
            command,
            term: self.current_term,
        });
        (self.log.len() - 1) as LogIndex
    }

    /// Whether the log holds `prev_log_term` at `prev_log_index`. An absent
    /// index means "no prior entry required" and always matches.
    pub fn matches_prev(&self, prev_log_index: Option<LogIndex>, prev_log_term: Option<Term>) -> bool {
        match prev_log_index {
            None => true,
            Some(index) => self.term_at(index).is_some_and(|t| Some(t) == prev_log_term),
        }
    }

    /// Reconcile the tail after `prev_log_index` with `entries`: entries that
    /// already match are kept, the first conflict truncates the local log and
    /// the remaining entries are appended. Returns whether the log changed.
    pub fn append_from(&mut self, prev_log_index: Option<LogIndex>, entries: &[LogEntry<C>]) -> bool {
        let mut insert_index = prev_log_index.map_or(0, |p| p as usize + 1);
        let mut new_index = 0;

        while insert_index < self.log.len()
            && new_index < entries.len()
            && self.log[insert_index].term == entries[new_index].term
        {
            insert_index += 1;
            new_index += 1;
        }

        if new_index < entries.len() {
            self.log.truncate(insert_index);
            self.log.extend_from_slice(&entries[new_index..]);
            true
        } else {
            false
        }
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: Option<LogIndex>, last_log_term: Option<Term>) -> bool {
        // Higher last term wins; equal terms compare by length. An empty log
        // (None, None) orders below every non-empty one.
        (last_log_term, last_log_index) >= (self.last_log_term(), self.last_log_index())
    }

    /// Transition to follower state at `term`
    pub fn become_follower(&mut self, term: Term) {
        if term != self.current_term {
            self.voted_for = None;
            self.leader_id = None;
        }
        self.role = NodeState::Follower;
        self.current_term = term;
        self.votes_received = 0;
        self.election_reset_event = Instant::now();
        self.timer_generation += 1;
    }

    /// Transition to candidate state, voting for ourselves in a new term
    pub fn become_candidate(&mut self, my_id: NodeId) {
        self.role = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1;
        self.leader_id = None;
        self.election_reset_event = Instant::now();
        self.timer_generation += 1;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: NodeId, peer_ids: &[NodeId]) {
        self.role = NodeState::Leader;
        self.leader_id = Some(my_id);
        self.timer_generation += 1;

        let next = self.log.len() as LogIndex;
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, next);
            self.match_index.insert(peer_id, None);
        }
    }

    pub fn stop(&mut self) {
        self.role = NodeState::Stopped;
        self.timer_generation += 1;
    }

    pub fn has_quorum(count: usize, cluster_size: usize) -> bool {
        count * 2 > cluster_size
    }

    /// Leader only: move `commit_index` to the highest current-term index
    /// replicated on a strict majority. Returns whether it advanced.
    pub fn advance_leader_commit(&mut self, peer_ids: &[NodeId]) -> bool {
        let saved = self.commit_index;
        let start = self.commit_index.map_or(0, |c| c + 1);

        for index in start..self.log.len() as LogIndex {
            if self.log[index as usize].term != self.current_term {
                continue;
            }
            let replicas = 1 + peer_ids
                .iter()
                .filter(|p| matches!(self.match_index.get(p), Some(Some(m)) if *m >= index))
                .count();
            if Self::has_quorum(replicas, peer_ids.len() + 1) {
                self.commit_index = Some(index);
            }
        }

        self.commit_index != saved
    }

    /// Follower only: adopt the leader's commit index, bounded by the last
    /// entry verified against the leader. Returns whether it advanced.
    pub fn advance_follower_commit(
        &mut self,
        leader_commit: Option<LogIndex>,
        last_verified: Option<LogIndex>,
    ) -> bool {
        if leader_commit <= self.commit_index {
            return false;
        }
        let target = std::cmp::min(leader_commit, last_verified);
        if target > self.commit_index {
            self.commit_index = target;
            true
        } else {
            false
        }
    }

    /// Drain entries committed since the last call, advancing `last_applied`.
    pub fn take_committed(&mut self) -> Vec<CommitEntry<C>> {
        let Some(commit) = self.commit_index else {
            return Vec::new();
        };
        let start = self.last_applied.map_or(0, |a| a + 1);
        if start > commit {
            return Vec::new();
        }

        let entries = self.log[start as usize..=commit as usize]
            .iter()
            .zip(start..)
            .map(|(entry, index)| CommitEntry {
                command: entry.command.clone(),
                index,
                term: entry.term,
            })
            .collect();
        self.last_applied = Some(commit);
        entries
    }
}

impl<C: Clone> Default for RaftState<C> {
    fn default() -> Self {
        Self::new()
    }
}
