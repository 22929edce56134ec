//! Multi-node tests over gRPC.
//!
//! Each node listens on its own localhost port and probes the others on a
//! short heartbeat.

mod common;

use common::{TestCluster, get_test_port};
use std::sync::Arc;
use std::time::Duration;
use stockrep_cluster::{
    ClusterConfig, GroupTransport, GrpcTransport, NodeId, ReplicaEndpoint, ReplicaHandler,
    ReplicatedStore, StockSnapshot, TransferOutcome,
};

/// Test that running nodes converge on one view with the oldest node first.
#[tokio::test]
async fn test_multi_node_view_convergence() {
    let mut cluster = TestCluster::new(3, 3).await;

    assert!(cluster.wait_for_views(3000).await, "Views should converge");

    for node in &cluster.nodes {
        let view = node.view();
        assert_eq!(view.len(), 3);
        assert_eq!(
            view.coordinator().map(|m| m.node_id),
            Some(1),
            "Node {} should see node 1 as coordinator",
            node.node_id()
        );
    }

    cluster.shutdown().await;
}

/// Test the set, CAS and join sequence end to end.
#[tokio::test]
async fn test_multi_node_replication() {
    let mut cluster = TestCluster::new(4, 3).await;
    assert!(cluster.wait_for_views(3000).await, "Views should converge");
    assert_eq!(cluster.nodes[0].transfer_outcome(), TransferOutcome::Founded);

    let responses = cluster.nodes[0].set("AAPL", 100.0).await.unwrap();
    assert_eq!(responses.num_received(), 3, "rsps:\n{}", responses);
    for node in &cluster.nodes {
        assert_eq!(node.get("AAPL"), Some(100.0), "node {}", node.node_id());
    }

    // Node 2 takes the lock remotely from node 1.
    let outcome = cluster.nodes[1]
        .compare_and_swap("AAPL", "100.0", "101.0")
        .await
        .unwrap();
    assert!(outcome.succeeded, "{}", outcome);
    for node in &cluster.nodes {
        assert_eq!(node.get("AAPL"), Some(101.0));
    }

    let outcome = cluster.nodes[2]
        .compare_and_swap("AAPL", "999.0", "5.0")
        .await
        .unwrap();
    assert!(!outcome.succeeded, "{}", outcome);
    for node in &cluster.nodes {
        assert_eq!(node.get("AAPL"), Some(101.0));
    }

    // Node 4 joins and copies the state.
    let joiner = cluster.start_next().await;
    assert_eq!(joiner.transfer_outcome(), TransferOutcome::Restored { stocks: 1 });
    let expected: StockSnapshot = [("AAPL".to_string(), 101.0)].into_iter().collect();
    assert_eq!(joiner.store().snapshot(), expected);

    cluster.shutdown().await;
}

/// Test that the group keeps working after the coordinator leaves.
#[tokio::test]
async fn test_multi_node_coordinator_leaves() {
    let mut cluster = TestCluster::new(3, 3).await;
    assert!(cluster.wait_for_views(3000).await, "Views should converge");

    cluster.nodes[0].set("MSFT", 200.0).await.unwrap();
    cluster.stop_node(1).await;

    assert!(
        cluster.wait_for_views(3000).await,
        "Remaining nodes should drop node 1"
    );
    for node in &cluster.nodes {
        assert_eq!(node.view().coordinator().map(|m| m.node_id), Some(2));
    }

    // Node 3 now locks through node 2.
    let outcome = cluster.nodes[1]
        .compare_and_swap("MSFT", "200", "201")
        .await
        .unwrap();
    assert!(outcome.succeeded, "{}", outcome);
    assert_eq!(outcome.tally.received, 2);
    for node in &cluster.nodes {
        assert_eq!(node.get("MSFT"), Some(201.0));
    }

    cluster.shutdown().await;
}

/// Test that a member is in everyone's broadcasts as soon as it has joined,
/// without waiting for the next heartbeat.
#[tokio::test]
async fn test_multi_node_joiner_receives_immediate_update() {
    let mut cluster = TestCluster::new(3, 2).await;
    assert!(cluster.wait_for_views(3000).await, "Views should converge");
    cluster.nodes[0].set("AAPL", 1.0).await.unwrap();

    cluster.start_next().await;
    let responses = cluster.nodes[0].set("AAPL", 2.0).await.unwrap();
    assert_eq!(responses.num_received(), 3, "rsps:\n{}", responses);
    for node in &cluster.nodes {
        assert_eq!(node.get("AAPL"), Some(2.0), "node {}", node.node_id());
    }

    cluster.shutdown().await;
}

async fn start_transport(node_id: NodeId, addresses: &[String]) -> GrpcTransport {
    let mut builder = ClusterConfig::builder()
        .node_id(node_id)
        .listen_addr(addresses[node_id as usize - 1].clone())
        .heartbeat(100, 50)
        .rpc_timeout_ms(1_000);
    for (i, addr) in addresses.iter().enumerate() {
        if i as NodeId + 1 != node_id {
            builder = builder.peer(i as NodeId + 1, addr.clone());
        }
    }
    let config = builder.build().expect("Invalid config");

    let endpoint = Arc::new(ReplicaEndpoint::new(node_id, Arc::new(ReplicatedStore::new())));
    endpoint.mark_ready();
    let handler: Arc<dyn ReplicaHandler> = endpoint;
    GrpcTransport::start(&config, handler)
        .await
        .expect("Failed to start transport")
}

/// Test that a lock request abandoned by its caller does not keep the lock.
#[tokio::test]
async fn test_multi_node_abandoned_lock_request_is_revoked() {
    let addresses: Vec<String> = (0..2)
        .map(|_| format!("127.0.0.1:{}", get_test_port()))
        .collect();
    let coordinator = start_transport(1, &addresses).await;
    let member = start_transport(2, &addresses).await;
    assert_eq!(member.view().coordinator().map(|m| m.node_id), Some(1));

    coordinator.acquire_lock("lock AAPL").await.unwrap();
    let waited =
        tokio::time::timeout(Duration::from_millis(300), member.acquire_lock("lock AAPL")).await;
    assert!(waited.is_err(), "Lock should still be held");

    // Let the revocation reach the coordinator before the lock frees up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    coordinator.release_lock("lock AAPL").await.unwrap();

    let reacquired =
        tokio::time::timeout(Duration::from_secs(2), coordinator.acquire_lock("lock AAPL")).await;
    assert!(matches!(reacquired, Ok(Ok(()))), "Lock should be free again");

    coordinator.release_lock("lock AAPL").await.unwrap();
    member.shutdown().await.unwrap();
    coordinator.shutdown().await.unwrap();
}
