//! Outbound calls to peers and inbound dispatch of Raft RPCs.
//!
//! The consensus core only ever sees [`Transport`]; a failed call is treated
//! as a lost message and retried by the next heartbeat or election.

pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use thiserror::Error;

use crate::raft::rpc::{RaftRequest, RaftResponse};
use crate::raft::state::{Command, NodeId};

pub use memory::{LocalNetwork, LocalTransport};
pub use tcp::{RpcServer, TcpTransport};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("no address known for peer {0}")]
    UnknownPeer(NodeId),

    #[error("call to peer {0} timed out")]
    Timeout(NodeId),

    #[error("unexpected reply to {method} from peer {peer_id}")]
    UnexpectedReply {
        peer_id: NodeId,
        method: &'static str,
    },

    #[error("remote error from peer {peer_id}: {message}")]
    Remote { peer_id: NodeId, message: String },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// `Call(peerId, method, args) -> reply, error`. The method name travels
/// with the request (see [`RaftRequest::method`]).
#[async_trait]
pub trait Transport<C: Command>: Send + Sync {
    async fn call(
        &self,
        peer_id: NodeId,
        request: RaftRequest<C>,
    ) -> Result<RaftResponse, TransportError>;
}

/// Target of inbound RPC dispatch.
#[async_trait]
pub trait RpcHandler<C: Command>: Send + Sync {
    async fn handle(&self, request: RaftRequest<C>) -> RaftResponse;
}
