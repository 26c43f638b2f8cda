//! TCP transport for Raft RPCs.
//!
//! Each call opens a connection, writes one length-prefixed JSON frame
//! naming the method, and reads one framed reply.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{RpcHandler, Transport, TransportError};
use crate::config::NodeConfig;
use crate::raft::rpc::{RaftRequest, RaftResponse, APPEND_ENTRIES_METHOD, REQUEST_VOTE_METHOD};
use crate::raft::state::{Command, NodeId};

/// Timeout for connection establishment.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest frame accepted from the wire.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct WireRequest {
    method: String,
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
enum WireReply {
    Reply(RaftResponse),
    Error(String),
}

impl WireRequest {
    fn encode<C: Command>(request: RaftRequest<C>) -> Result<Self, serde_json::Error> {
        let method = request.method().to_string();
        let args = match request {
            RaftRequest::RequestVote(args) => serde_json::to_value(args)?,
            RaftRequest::AppendEntries(args) => serde_json::to_value(args)?,
        };
        Ok(Self { method, args })
    }

    /// Route by method name back to a typed request.
    fn decode<C: Command>(self) -> Result<RaftRequest<C>, String> {
        match self.method.as_str() {
            REQUEST_VOTE_METHOD => serde_json::from_value(self.args)
                .map(RaftRequest::RequestVote)
                .map_err(|e| format!("bad {} args: {}", REQUEST_VOTE_METHOD, e)),
            APPEND_ENTRIES_METHOD => serde_json::from_value(self.args)
                .map(RaftRequest::AppendEntries)
                .map_err(|e| format!("bad {} args: {}", APPEND_ENTRIES_METHOD, e)),
            other => Err(format!("unknown method {other:?}")),
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Read one frame; `None` on a clean end of stream.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Outbound side: resolves peer ids to addresses and performs calls.
pub struct TcpTransport<C> {
    node_id: NodeId,
    peers: RwLock<HashMap<NodeId, String>>,
    _command: PhantomData<fn() -> C>,
}

impl<C: Command> TcpTransport<C> {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            peers: RwLock::new(HashMap::new()),
            _command: PhantomData,
        }
    }

    /// Transport knowing every peer listed in `config`.
    pub fn from_config(config: &NodeConfig) -> Self {
        let peers = config
            .peers
            .iter()
            .map(|p| (p.node_id, p.addr.clone()))
            .collect();
        Self {
            node_id: config.node_id,
            peers: RwLock::new(peers),
            _command: PhantomData,
        }
    }

    pub async fn connect_to_peer(&self, peer_id: NodeId, addr: impl Into<String>) {
        let addr = addr.into();
        tracing::info!(node_id = self.node_id, peer_id, addr = %addr, "Registered peer");
        self.peers.write().await.insert(peer_id, addr);
    }

    pub async fn disconnect_peer(&self, peer_id: NodeId) -> bool {
        self.peers.write().await.remove(&peer_id).is_some()
    }

    async fn do_call(
        addr: &str,
        peer_id: NodeId,
        frame: &[u8],
    ) -> Result<RaftResponse, TransportError> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(peer_id))??;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, frame).await?;
        let reply = read_frame(&mut stream).await?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before reply",
            )
        })?;

        match serde_json::from_slice::<WireReply>(&reply)? {
            WireReply::Reply(response) => Ok(response),
            WireReply::Error(message) => Err(TransportError::Remote { peer_id, message }),
        }
    }
}

#[async_trait]
impl<C: Command> Transport<C> for TcpTransport<C> {
    async fn call(
        &self,
        peer_id: NodeId,
        request: RaftRequest<C>,
    ) -> Result<RaftResponse, TransportError> {
        let addr = self
            .peers
            .read()
            .await
            .get(&peer_id)
            .cloned()
            .ok_or(TransportError::UnknownPeer(peer_id))?;

        let frame = serde_json::to_vec(&WireRequest::encode(request)?)?;
        Self::do_call(&addr, peer_id, &frame).await
    }
}

/// Inbound side: accepts connections and dispatches each framed request.
pub struct RpcServer<C: Command> {
    listener: TcpListener,
    handler: Arc<dyn RpcHandler<C>>,
}

impl<C: Command> RpcServer<C> {
    pub fn new(listener: TcpListener, handler: Arc<dyn RpcHandler<C>>) -> Self {
        Self { listener, handler }
    }

    pub async fn bind(addr: SocketAddr, handler: Arc<dyn RpcHandler<C>>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, handler))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Raft RPC server listening");

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Raft RPC server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted?,
            };

            let handler = Arc::clone(&self.handler);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = Self::handle_connection(handler, stream) => {
                        if let Err(e) = result {
                            tracing::warn!(peer = %peer_addr, error = %e, "Error handling Raft RPC");
                        }
                    }
                }
            });
        }
    }

    async fn handle_connection(
        handler: Arc<dyn RpcHandler<C>>,
        mut stream: TcpStream,
    ) -> Result<(), TransportError> {
        while let Some(frame) = read_frame(&mut stream).await? {
            let reply = match serde_json::from_slice::<WireRequest>(&frame) {
                Ok(wire) => match wire.decode::<C>() {
                    Ok(request) => WireReply::Reply(handler.handle(request).await),
                    Err(message) => WireReply::Error(message),
                },
                Err(e) => WireReply::Error(format!("malformed request: {e}")),
            };
            write_frame(&mut stream, &serde_json::to_vec(&reply)?).await?;
        }
        Ok(())
    }
}
