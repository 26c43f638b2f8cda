use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::raft::node::NodeStatus;
use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, RaftRequest, RaftResponse, RequestVoteArgs,
    RequestVoteReply,
};
use crate::raft::state::{Command, CommitEntry, LogEntry, LogIndex, NodeId};
use crate::raft::RaftNode;
use crate::transport::{RpcHandler, RpcServer, TcpTransport, Transport};

/// The boundary object a cluster member exposes: client submissions in,
/// inbound RPCs routed to consensus, outbound RPCs through the transport.
pub struct Node<C: Command> {
    config: NodeConfig,
    raft: Arc<RaftNode<C>>,
}

impl<C: Command> Node<C> {
    /// Build a node. Committed entries are published on `commit_tx`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` fails validation.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport<C>>,
        commit_tx: mpsc::Sender<CommitEntry<C>>,
    ) -> Result<Arc<Self>> {
        let raft = RaftNode::new(config.clone(), transport, commit_tx)?;
        Ok(Arc::new(Self { config, raft }))
    }

    /// Build a node serving RPCs over TCP on `config.listen_addr`.
    ///
    /// The node is not started. Peer addresses can still be replaced on the
    /// returned transport (useful when peers bind port 0) before calling
    /// [`start`](Self::start).
    pub async fn bind_tcp(
        config: NodeConfig,
        commit_tx: mpsc::Sender<CommitEntry<C>>,
    ) -> Result<TcpNode<C>> {
        let listen_addr = config.listen_addr;
        let transport = Arc::new(TcpTransport::from_config(&config));
        let node = Self::new(config, transport.clone(), commit_tx)?;

        let server = RpcServer::bind(listen_addr, node.clone()).await?;
        let local_addr = server.local_addr()?;

        let shutdown = CancellationToken::new();
        let server_handle = tokio::spawn(server.run(shutdown.clone()));

        Ok(TcpNode {
            node,
            transport,
            local_addr,
            shutdown,
            server_handle,
        })
    }

    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    /// Peers are reachable: begin election timing.
    pub async fn start(&self) {
        self.raft.start().await;
    }

    /// Accept `command` if this node is the leader. Callers retry elsewhere on `false`.
    pub async fn submit(&self, command: C) -> bool {
        let accepted = self.raft.submit(command).await;
        tracing::debug!(node_id = self.id(), accepted, "Submit");
        accepted
    }

    /// Like [`submit`](Self::submit), but reports the assigned index or why it was refused.
    pub async fn propose(&self, command: C) -> Result<LogIndex> {
        self.raft.propose(command).await
    }

    pub async fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        self.raft.request_vote(args).await
    }

    pub async fn append_entries(&self, args: AppendEntriesArgs<C>) -> AppendEntriesReply {
        self.raft.append_entries(args).await
    }

    pub async fn status(&self) -> NodeStatus {
        self.raft.status().await
    }

    pub async fn is_leader(&self) -> bool {
        self.raft.is_leader().await
    }

    pub async fn log_snapshot(&self) -> Vec<LogEntry<C>> {
        self.raft.log_snapshot().await
    }

    pub async fn shutdown(&self) {
        self.raft.stop().await;
    }
}

#[async_trait]
impl<C: Command> RpcHandler<C> for Node<C> {
    async fn handle(&self, request: RaftRequest<C>) -> RaftResponse {
        match request {
            RaftRequest::RequestVote(args) => RaftResponse::RequestVote(self.request_vote(args).await),
            RaftRequest::AppendEntries(args) => {
                RaftResponse::AppendEntries(self.append_entries(args).await)
            }
        }
    }
}

/// A [`Node`] bound to a TCP listener.
pub struct TcpNode<C: Command> {
    pub node: Arc<Node<C>>,
    pub transport: Arc<TcpTransport<C>>,
    pub local_addr: SocketAddr,
    shutdown: CancellationToken,
    server_handle: JoinHandle<std::io::Result<()>>,
}

impl<C: Command> TcpNode<C> {
    /// Stop consensus, then the RPC server.
    pub async fn shutdown(self) {
        self.node.shutdown().await;
        self.shutdown.cancel();
        match self.server_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "RPC server exited with error"),
            Err(e) => tracing::warn!(error = %e, "RPC server task failed"),
        }
    }
}
