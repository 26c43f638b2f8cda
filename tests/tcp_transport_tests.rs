//! End-to-end tests over real loopback sockets.

use std::net::SocketAddr;
use std::time::Duration;

use raft_lite::config::NodeConfig;
use raft_lite::node::{Node, TcpNode};
use raft_lite::raft::rpc::{AppendEntriesArgs, RaftRequest, RaftResponse, RequestVoteArgs};
use raft_lite::raft::{CommitEntry, LogEntry};
use raft_lite::transport::{TcpTransport, Transport, TransportError};
use tokio::sync::mpsc;

fn loopback_config(node_id: u64, peers: &[u64]) -> NodeConfig {
    let mut config = NodeConfig::new(node_id, SocketAddr::from(([127, 0, 0, 1], 0)));
    for &peer in peers {
        // Replaced with the real address once every node is bound
        config = config.with_peer(peer, "127.0.0.1:1".to_string());
    }
    config.election_timeout_min_ms = 100;
    config.election_timeout_max_ms = 200;
    config.heartbeat_interval_ms = 30;
    config.rpc_timeout_ms = 100;
    config
}

async fn start_cluster(
    size: u64,
) -> (Vec<TcpNode<String>>, Vec<mpsc::Receiver<CommitEntry<String>>>) {
    let ids: Vec<u64> = (1..=size).collect();
    let mut nodes = Vec::new();
    let mut receivers = Vec::new();

    for &id in &ids {
        let peers: Vec<u64> = ids.iter().copied().filter(|&p| p != id).collect();
        let (tx, rx) = mpsc::channel(64);
        let node = Node::bind_tcp(loopback_config(id, &peers), tx)
            .await
            .expect("bind should succeed");
        nodes.push(node);
        receivers.push(rx);
    }

    let addrs: Vec<(u64, SocketAddr)> = nodes.iter().map(|n| (n.node.id(), n.local_addr)).collect();
    for node in &nodes {
        for &(peer_id, addr) in &addrs {
            if peer_id != node.node.id() {
                node.transport.connect_to_peer(peer_id, addr.to_string()).await;
            }
        }
    }

    for node in &nodes {
        node.node.start().await;
    }
    (nodes, receivers)
}

async fn wait_for_tcp_leader(nodes: &[TcpNode<String>], timeout: Duration) -> Option<usize> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        for (i, node) in nodes.iter().enumerate() {
            if node.node.is_leader().await {
                return Some(i);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

#[tokio::test]
async fn test_tcp_cluster_replicates_commands() {
    let (nodes, mut receivers) = start_cluster(3).await;

    let leader = wait_for_tcp_leader(&nodes, Duration::from_secs(5))
        .await
        .expect("Leader should be elected over TCP");

    for command in ["alpha", "beta"] {
        assert!(nodes[leader].node.submit(command.to_string()).await);
    }

    for (i, rx) in receivers.iter_mut().enumerate() {
        for (expected_index, expected) in ["alpha", "beta"].iter().enumerate() {
            let entry = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap_or_else(|_| panic!("Node {} timed out waiting for commit", i + 1))
                .expect("Commit channel should stay open");
            assert_eq!(entry.index, expected_index as u64);
            assert_eq!(&entry.command, expected);
        }
    }

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_tcp_transport_round_trips_rpcs() {
    let (tx, _rx) = mpsc::channel(8);
    let server = Node::<String>::bind_tcp(loopback_config(2, &[]), tx)
        .await
        .expect("bind should succeed");

    let client = TcpTransport::<String>::new(1);
    client.connect_to_peer(2, server.local_addr.to_string()).await;

    let reply = client
        .call(
            2,
            RaftRequest::RequestVote(RequestVoteArgs {
                term: 3,
                candidate_id: 1,
                last_log_index: None,
                last_log_term: None,
            }),
        )
        .await
        .expect("RequestVote should succeed");
    match reply {
        RaftResponse::RequestVote(reply) => {
            assert!(reply.vote_granted);
            assert_eq!(reply.term, 3);
        }
        other => panic!("unexpected reply {:?}", other),
    }

    let reply = client
        .call(
            2,
            RaftRequest::AppendEntries(AppendEntriesArgs {
                term: 3,
                leader_id: 1,
                prev_log_index: None,
                prev_log_term: None,
                entries: vec![LogEntry {
                    command: "over the wire".to_string(),
                    term: 3,
                }],
                leader_commit: None,
            }),
        )
        .await
        .expect("AppendEntries should succeed");
    assert_eq!(
        reply,
        RaftResponse::AppendEntries(raft_lite::raft::rpc::AppendEntriesReply {
            term: 3,
            success: true
        })
    );
    assert_eq!(server.node.log_snapshot().await.len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_tcp_call_to_closed_port_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = TcpTransport::<String>::new(1);
    client.connect_to_peer(2, addr.to_string()).await;

    let err = client
        .call(
            2,
            RaftRequest::RequestVote(RequestVoteArgs {
                term: 1,
                candidate_id: 1,
                last_log_index: None,
                last_log_term: None,
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Io(_) | TransportError::Timeout(_)));
}
