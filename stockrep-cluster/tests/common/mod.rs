//! Common test utilities for stockrep-cluster tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use stockrep_cluster::{
    ClusterConfig, InMemoryNetwork, NodeId, NodeOptions, ReplicaEndpoint, ReplicaNode,
    ReplicatedStore,
};

/// Atomic counter for allocating unique ports.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(17800);

/// Get a unique port for testing.
#[allow(dead_code)]
pub fn get_test_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Replica nodes sharing one in-process network.
#[allow(dead_code)]
pub struct MemoryCluster {
    pub network: InMemoryNetwork,
    pub nodes: Vec<ReplicaNode>,
    options: NodeOptions,
}

#[allow(dead_code)]
impl MemoryCluster {
    /// Start `node_count` nodes with default options.
    pub async fn new(node_count: usize) -> Self {
        Self::with_options(node_count, NodeOptions::default()).await
    }

    /// Start `node_count` nodes, one after another, with node IDs 1..=n.
    pub async fn with_options(node_count: usize, options: NodeOptions) -> Self {
        let mut cluster = Self {
            network: InMemoryNetwork::new(),
            nodes: Vec::with_capacity(node_count),
            options,
        };
        for _ in 0..node_count {
            cluster.add_node().await;
        }
        cluster
    }

    /// Join one more node and return its index.
    pub async fn add_node(&mut self) -> usize {
        let node_id = self.nodes.len() as NodeId + 1;
        let endpoint = Arc::new(ReplicaEndpoint::new(node_id, Arc::new(ReplicatedStore::new())));
        let transport = self
            .network
            .join(node_id, endpoint.clone())
            .expect("Failed to join network");

        let node = ReplicaNode::join(endpoint, Arc::new(transport), self.options)
            .await
            .expect("Failed to join group");
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Every node's local price for `symbol`.
    pub fn prices(&self, symbol: &str) -> Vec<Option<f64>> {
        self.nodes.iter().map(|n| n.get(symbol)).collect()
    }
}

/// Replica nodes talking over gRPC on localhost.
#[allow(dead_code)]
pub struct TestCluster {
    /// Running nodes.
    pub nodes: Vec<ReplicaNode>,
    /// Node addresses, indexed like `configs`.
    pub addresses: Vec<String>,
    /// Configurations for every slot, started or not.
    configs: Vec<ClusterConfig>,
    /// Index of the next slot to start.
    next: usize,
}

#[allow(dead_code)]
impl TestCluster {
    /// Plan a cluster of `node_count` slots and start the first `start` of them.
    pub async fn new(node_count: usize, start: usize) -> Self {
        let addresses: Vec<String> = (0..node_count)
            .map(|_| format!("127.0.0.1:{}", get_test_port()))
            .collect();

        let configs = (0..node_count)
            .map(|i| {
                let node_id = i as NodeId + 1;
                let mut builder = ClusterConfig::builder()
                    .node_id(node_id)
                    .listen_addr(addresses[i].clone())
                    .heartbeat(100, 50)
                    .rpc_timeout_ms(1_000)
                    .state_transfer_timeout_ms(5_000);

                for (j, addr) in addresses.iter().enumerate() {
                    if j != i {
                        builder = builder.peer(j as NodeId + 1, addr.clone());
                    }
                }
                builder.build().expect("Invalid config")
            })
            .collect();

        let mut cluster = Self {
            nodes: Vec::with_capacity(node_count),
            addresses,
            configs,
            next: 0,
        };
        for _ in 0..start {
            cluster.start_next().await;
        }
        cluster
    }

    /// Start the next planned node.
    pub async fn start_next(&mut self) -> &ReplicaNode {
        let config = self.configs[self.next].clone();
        self.next += 1;
        let node = ReplicaNode::start(config)
            .await
            .expect("Failed to start node");
        self.nodes.push(node);
        self.nodes.last().expect("node was just pushed")
    }

    /// Shut down the node with `node_id` and drop it from the cluster.
    pub async fn stop_node(&mut self, node_id: NodeId) {
        let index = self
            .nodes
            .iter()
            .position(|n| n.node_id() == node_id)
            .expect("No such node");
        let node = self.nodes.remove(index);
        node.shutdown().await.expect("Failed to shut down node");
    }

    /// Wait until every running node sees exactly the running nodes.
    pub async fn wait_for_views(&self, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let expected: Vec<NodeId> = self.nodes.iter().map(|n| n.node_id()).collect();

        while Instant::now() < deadline {
            let converged = self.nodes.iter().all(|node| {
                let mut ids = node.view().member_ids();
                ids.sort_unstable();
                ids == expected
            });
            if converged {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Shutdown all nodes.
    pub async fn shutdown(&mut self) {
        for node in &self.nodes {
            let _ = node.shutdown().await;
        }
    }
}
