use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{RaftError, Result};
use crate::raft::state::NodeId;
use crate::raft::timer::random_election_timeout;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Granularity at which the election timer checks for expiry.
    pub election_tick_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Deadline for a single outbound RPC before it counts as lost.
    pub rpc_timeout_ms: u64,
    /// Buffered "new commits ready" signals; further signals are coalesced.
    pub commit_signal_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7001)),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            election_tick_ms: 10,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            commit_signal_capacity: 16,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: NodeId, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.node_id).collect()
    }

    /// Draw a fresh randomized election timeout from the configured window.
    pub fn election_timeout(&self) -> Duration {
        random_election_timeout(self.election_timeout_min_ms, self.election_timeout_max_ms)
    }

    pub fn election_tick(&self) -> Duration {
        Duration::from_millis(self.election_tick_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Reject configurations under which elections cannot work reliably.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms >= self.election_timeout_max_ms
        {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout window {}..{}ms is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {}ms must be below the minimum election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.election_tick_ms == 0 {
            return Err(RaftError::InvalidConfig(
                "election tick must be nonzero".to_string(),
            ));
        }
        if self.commit_signal_capacity == 0 {
            return Err(RaftError::InvalidConfig(
                "commit signal capacity must be nonzero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return Err(RaftError::InvalidConfig(format!(
                    "node {} lists itself as a peer",
                    self.node_id
                )));
            }
            if !seen.insert(peer.node_id) {
                return Err(RaftError::InvalidConfig(format!(
                    "duplicate peer id {}",
                    peer.node_id
                )));
            }
        }
        Ok(())
    }
}

/// Parse a peer list of the form `"2:127.0.0.1:7002,3:127.0.0.1:7003"`.
pub fn parse_peers(peers_str: &str) -> Result<Vec<PeerConfig>> {
    if peers_str.trim().is_empty() {
        return Ok(Vec::new());
    }

    peers_str
        .split(',')
        .map(|peer| {
            let peer = peer.trim();
            let (id, addr) = peer.split_once(':').ok_or_else(|| {
                RaftError::InvalidConfig(format!("invalid peer {peer:?}, expected id:host:port"))
            })?;
            let node_id = id.parse::<NodeId>().map_err(|_| {
                RaftError::InvalidConfig(format!("invalid peer id {id:?} in {peer:?}"))
            })?;
            match addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(PeerConfig {
                        node_id,
                        addr: addr.to_string(),
                    })
                }
                _ => Err(RaftError::InvalidConfig(format!(
                    "invalid peer address {addr:?}, expected host:port"
                ))),
            }
        })
        .collect()
}
