pub mod config;
pub mod error;
pub mod node;
pub mod raft;
pub mod shutdown;
pub mod transport;

pub use config::NodeConfig;
pub use error::{RaftError, Result};
pub use node::{Node, TcpNode};
pub use raft::{Command, CommitEntry, LogEntry, NodeState, NodeStatus};
