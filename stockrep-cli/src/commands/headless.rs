//! Headless mode - serve the replica until interrupted.

use anyhow::Result;
use stockrep_cluster::ReplicaNode;

/// Serve replica RPCs until Ctrl+C, then leave the group.
pub async fn run(node: ReplicaNode) -> Result<()> {
    println!("Node {} serving view {}", node.node_id(), node.view());
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown signal received");
    node.shutdown().await?;
    Ok(())
}
