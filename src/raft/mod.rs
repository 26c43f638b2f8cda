pub mod commit;
pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;

pub use node::{NodeStatus, RaftNode};
pub use state::{Command, CommitEntry, LogEntry, LogIndex, NodeId, NodeState, RaftState, Term};
