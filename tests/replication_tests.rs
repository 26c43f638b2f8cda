//! Log replication and commit delivery tests.


use std::time::Duration;

use test_harness::{wait_for, TestCluster};

/// Test 1: A lone node commits its own command at index 0
#[tokio::test]
async fn test_single_node_commits() {
    let mut cluster = TestCluster::new(1).await;
    cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("Single node should become leader");

    let index = cluster.submit("solo").await.expect("Leader should accept");
    assert_eq!(index, 0);

    assert!(
        cluster.wait_for_commits_on_all(1, Duration::from_secs(2)).await,
        "Command should commit without peers"
    );
    let committed = cluster.get_node(1).unwrap().committed().await;
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].command, "solo");
    assert_eq!(committed[0].index, 0);
    assert_eq!(committed[0].term, 1);

    cluster.shutdown().await;
}

/// Test 2: Commands reach every node's commit channel in submission order
#[tokio::test]
async fn test_commands_commit_in_order_everywhere() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let commands: Vec<String> = (0..5).map(|i| format!("set x {}", i)).collect();
    for (i, command) in commands.iter().enumerate() {
        let index = cluster
            .submit_to_node(leader, command)
            .await
            .expect("Leader should accept");
        assert_eq!(index, i as u64);
    }

    assert!(
        cluster.wait_for_commits_on_all(5, Duration::from_secs(5)).await,
        "All nodes should deliver 5 commits"
    );

    for node in cluster.nodes.values() {
        let committed = node.committed().await;
        let indices: Vec<u64> = committed.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4], "Node {} indices", node.node_id);
        assert_eq!(node.committed_commands().await, commands, "Node {} commands", node.node_id);
    }

    assert!(cluster.verify_log_consistency().await);
    cluster.shutdown().await;
}

/// Test 3: Each index is delivered exactly once, even across many heartbeats
#[tokio::test]
async fn test_no_duplicate_delivery() {
    let mut cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    cluster.submit("once").await.expect("Leader should accept");
    assert!(cluster.wait_for_commits_on_all(1, Duration::from_secs(5)).await);

    // Many heartbeat rounds later, still one delivery per node
    tokio::time::sleep(Duration::from_millis(300)).await;
    for node in cluster.nodes.values() {
        assert_eq!(node.committed().await.len(), 1, "Node {}", node.node_id);
    }

    cluster.shutdown().await;
}

/// Test 4: Commit indices and applied indices agree once delivery settles
#[tokio::test]
async fn test_status_tracks_commit_and_apply() {
    let mut cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    for i in 0..3 {
        cluster.submit(&format!("cmd {}", i)).await.expect("Leader should accept");
    }
    assert!(cluster.wait_for_commits_on_all(3, Duration::from_secs(5)).await);

    for node in cluster.nodes.values() {
        let status = node.status().await;
        assert_eq!(status.commit_index, Some(2), "Node {}", node.node_id);
        assert_eq!(status.last_applied, Some(2), "Node {}", node.node_id);
        assert_eq!(status.log_len, 3, "Node {}", node.node_id);
    }

    cluster.shutdown().await;
}

/// Test 5: A minority of live nodes cannot commit
#[tokio::test]
async fn test_no_commit_without_majority() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    cluster.isolate_node(leader).await;
    cluster
        .submit_to_node(leader, "stranded")
        .await
        .expect("Isolated leader still accepts");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let node = cluster.get_node(leader).unwrap();
    assert_eq!(node.log_len().await, 1);
    assert!(node.committed().await.is_empty(), "Entry must not commit without a majority");
    assert_eq!(node.status().await.commit_index, None);

    cluster.shutdown().await;
}

/// Test 6: A new leader does not commit earlier-term entries until it commits one of its own
#[tokio::test]
async fn test_new_leader_commits_prior_entries_with_own_entry() {
    let mut cluster = TestCluster::new(3).await;
    let first = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    cluster.submit_to_node(first, "a").await.expect("Leader should accept");
    assert!(cluster.wait_for_commits_on_all(1, Duration::from_secs(5)).await);

    assert!(cluster.crash_node(first).await);
    let second = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Survivors should elect a leader");

    cluster.submit_to_node(second, "b").await.expect("New leader should accept");
    assert!(
        cluster.wait_for_commits_on_all(2, Duration::from_secs(5)).await,
        "Both entries should commit on the survivors"
    );

    for node in cluster.nodes.values() {
        let committed = node.committed().await;
        assert_eq!(node.committed_commands().await, vec!["a", "b"]);
        assert!(committed[1].term > committed[0].term);
    }

    cluster.shutdown().await;
}

/// Test 7: A follower that missed entries catches up after reconnecting
#[tokio::test]
async fn test_lagging_follower_catches_up() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let lagging = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader)
        .unwrap();

    cluster.isolate_node(lagging).await;
    for i in 0..4 {
        cluster
            .submit_to_node(leader, &format!("while-away {}", i))
            .await
            .expect("Leader should accept");
    }

    let others: Vec<u64> = cluster
        .active_node_ids()
        .into_iter()
        .filter(|&id| id != lagging)
        .collect();
    assert!(cluster.wait_for_commits_on_nodes(&others, 4, Duration::from_secs(5)).await);
    assert!(cluster.get_node(lagging).unwrap().committed().await.is_empty());

    cluster.heal_node(lagging).await;
    assert!(
        cluster.wait_for_commits_on_nodes(&[lagging], 4, Duration::from_secs(5)).await,
        "Lagging follower should catch up"
    );

    let converged = wait_for(
        || async { cluster.verify_log_consistency().await },
        Duration::from_secs(2),
        Duration::from_millis(20),
    )
    .await;
    assert!(converged, "Logs should converge");

    cluster.shutdown().await;
}
