//! The local side of the replica RPC surface.

use crate::command::{ReplicaCommand, ReplicaResponse};
use crate::error::{ClusterError, ClusterResult};
use crate::transport::ReplicaHandler;
use crate::types::NodeId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::snapshot::StockSnapshot;
use super::store::ReplicatedStore;

/// Serves incoming replica RPCs against the local store.
///
/// Until [`mark_ready`](Self::mark_ready) is called the endpoint answers
/// `NotReady`, so a member that is still joining never votes or donates
/// with an unknown state. Commands delivered in that window are queued
/// and applied on top of the transferred state once the endpoint is
/// ready, so updates sent while a member joins are not lost.
#[derive(Debug)]
pub struct ReplicaEndpoint {
    node_id: NodeId,
    store: Arc<ReplicatedStore>,
    ready: AtomicBool,
    /// Commands received before ready, in arrival order.
    pending: Mutex<Vec<ReplicaCommand>>,
}

impl ReplicaEndpoint {
    /// Create an endpoint over a store. The endpoint starts not ready.
    pub fn new(node_id: NodeId, store: Arc<ReplicatedStore>) -> Self {
        Self {
            node_id,
            store,
            ready: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// This member's node ID.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The store behind this endpoint.
    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }

    /// Apply the commands queued while joining, then start serving.
    pub fn mark_ready(&self) {
        // Holding the queue lock while flipping the flag keeps queued
        // commands ahead of any that arrive afterwards.
        let mut pending = self.pending.lock();
        let queued = std::mem::take(&mut *pending);
        for cmd in &queued {
            self.store.apply(cmd);
        }
        self.ready.store(true, Ordering::Release);

        if !queued.is_empty() {
            tracing::info!(
                node_id = self.node_id,
                applied = queued.len(),
                "applied commands received during state transfer"
            );
        }
    }

    /// Number of commands waiting for the endpoint to become ready.
    pub fn queued(&self) -> usize {
        self.pending.lock().len()
    }

    /// Install state received from a donor (the `setState` RPC).
    pub fn set_state(&self, bytes: &[u8]) -> ClusterResult<usize> {
        let snapshot = StockSnapshot::decode(bytes)?;
        let count = snapshot.len();
        tracing::info!(node_id = self.node_id, stocks = count, "-- received state");
        self.store.restore(snapshot);
        Ok(count)
    }
}

impl ReplicaHandler for ReplicaEndpoint {
    fn handle(&self, cmd: ReplicaCommand) -> ClusterResult<ReplicaResponse> {
        if !self.is_ready() {
            let mut pending = self.pending.lock();
            // mark_ready flips the flag under this lock.
            if !self.is_ready() {
                tracing::debug!(
                    command = cmd.name(),
                    symbol = cmd.symbol(),
                    "queueing replica command until state transfer completes"
                );
                pending.push(cmd);
                return Err(ClusterError::NotReady(self.node_id));
            }
        }
        tracing::debug!(command = cmd.name(), symbol = cmd.symbol(), "applying replica command");
        Ok(self.store.apply(&cmd))
    }

    fn serve_state(&self) -> ClusterResult<Vec<u8>> {
        if !self.is_ready() {
            return Err(ClusterError::NotReady(self.node_id));
        }
        let snapshot = self.store.snapshot();
        tracing::info!(node_id = self.node_id, stocks = snapshot.len(), "-- returning state");
        snapshot.encode()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
