use thiserror::Error;

use crate::raft::state::NodeId;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("Node {0} is stopped")]
    Stopped(NodeId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
