//! In-process network connecting nodes of one cluster.
//!
//! Links can be cut and restored to simulate partitions; a call across a cut
//! link, or to a node that is not registered, fails as unreachable.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{RpcHandler, Transport, TransportError};
use crate::raft::rpc::{RaftRequest, RaftResponse};
use crate::raft::state::{Command, NodeId};

pub struct LocalNetwork<C: Command> {
    handlers: RwLock<HashMap<NodeId, Arc<dyn RpcHandler<C>>>>,
    /// Cut links, stored in both directions.
    cut_links: RwLock<HashSet<(NodeId, NodeId)>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl<C: Command> LocalNetwork<C> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            cut_links: RwLock::new(HashSet::new()),
            isolated: RwLock::new(HashSet::new()),
        })
    }

    /// Outbound handle for `node_id`.
    pub fn transport(self: &Arc<Self>, node_id: NodeId) -> Arc<LocalTransport<C>> {
        Arc::new(LocalTransport {
            node_id,
            network: Arc::clone(self),
        })
    }

    /// Route inbound calls for `node_id` to `handler`.
    pub async fn register(&self, node_id: NodeId, handler: Arc<dyn RpcHandler<C>>) {
        self.handlers.write().await.insert(node_id, handler);
    }

    pub async fn unregister(&self, node_id: NodeId) -> bool {
        self.handlers.write().await.remove(&node_id).is_some()
    }

    pub async fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut cut = self.cut_links.write().await;
        cut.insert((a, b));
        cut.insert((b, a));
        tracing::debug!(a, b, "Link cut");
    }

    pub async fn reconnect(&self, a: NodeId, b: NodeId) {
        let mut cut = self.cut_links.write().await;
        cut.remove(&(a, b));
        cut.remove(&(b, a));
        tracing::debug!(a, b, "Link restored");
    }

    /// Cut `node_id` off from every other node.
    pub async fn isolate(&self, node_id: NodeId) {
        self.isolated.write().await.insert(node_id);
        tracing::debug!(node_id, "Node isolated");
    }

    /// Undo [`isolate`](Self::isolate) and restore every cut link of `node_id`.
    pub async fn heal(&self, node_id: NodeId) {
        self.isolated.write().await.remove(&node_id);
        self.cut_links
            .write()
            .await
            .retain(|&(a, b)| a != node_id && b != node_id);
        tracing::debug!(node_id, "Node healed");
    }

    pub async fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        {
            let isolated = self.isolated.read().await;
            if isolated.contains(&from) || isolated.contains(&to) {
                return false;
            }
        }
        !self.cut_links.read().await.contains(&(from, to))
    }

    async fn deliver(
        &self,
        from: NodeId,
        to: NodeId,
        request: RaftRequest<C>,
    ) -> Result<RaftResponse, TransportError> {
        if !self.is_connected(from, to).await {
            return Err(TransportError::Unreachable(to));
        }
        let handler = self
            .handlers
            .read()
            .await
            .get(&to)
            .cloned()
            .ok_or(TransportError::Unreachable(to))?;
        Ok(handler.handle(request).await)
    }
}

/// A node's view of a [`LocalNetwork`].
pub struct LocalTransport<C: Command> {
    node_id: NodeId,
    network: Arc<LocalNetwork<C>>,
}

#[async_trait]
impl<C: Command> Transport<C> for LocalTransport<C> {
    async fn call(
        &self,
        peer_id: NodeId,
        request: RaftRequest<C>,
    ) -> Result<RaftResponse, TransportError> {
        self.network.deliver(self.node_id, peer_id, request).await
    }
}
