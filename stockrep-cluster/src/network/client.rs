//! gRPC client for calls to peer replicas.

use crate::command::{ReplicaCommand, ReplicaResponse};
use crate::error::{ClusterError, ClusterResult};
use crate::proto::lock_service_client::LockServiceClient;
use crate::proto::replica_service_client::ReplicaServiceClient;
use crate::proto::{
    GetStateRequest, InvokeRequest, LockRequest, PingRequest, PingResponse, UnlockRequest,
};
use crate::transport::LockOwner;
use crate::types::{Member, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Channel;

/// Cached connections to peer replicas.
#[derive(Clone)]
pub struct PeerClients {
    /// Cached channels keyed by node, with the address they were built for.
    connections: Arc<RwLock<HashMap<NodeId, (String, Channel)>>>,
    connect_timeout: Duration,
}

impl PeerClients {
    /// Create an empty connection cache.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
        }
    }

    /// Get or create a channel to a node.
    ///
    /// Channels connect lazily, so an unreachable peer surfaces as an
    /// `Unavailable` status on the first call rather than here.
    fn channel(&self, target: NodeId, addr: &str) -> ClusterResult<Channel> {
        // Check cache first
        {
            let connections = self.connections.read();
            if let Some((cached_addr, channel)) = connections.get(&target) {
                if cached_addr == addr {
                    return Ok(channel.clone());
                }
            }
        }

        let endpoint = format!("http://{}", addr);
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| ClusterError::Config(e.to_string()))?
            .connect_timeout(self.connect_timeout)
            .connect_lazy();

        // Cache it
        {
            let mut connections = self.connections.write();
            connections.insert(target, (addr.to_string(), channel.clone()));
        }

        Ok(channel)
    }

    /// Invoke a replica command on a peer.
    pub async fn invoke(
        &self,
        origin: NodeId,
        target: NodeId,
        addr: &str,
        cmd: &ReplicaCommand,
    ) -> ClusterResult<ReplicaResponse> {
        let mut client = ReplicaServiceClient::new(self.channel(target, addr)?);

        let command = serde_json::to_vec(cmd)?;
        let response = client.invoke(InvokeRequest { origin, command }).await?;

        Ok(serde_json::from_slice(&response.into_inner().response)?)
    }

    /// Fetch a peer's serialized state.
    pub async fn get_state(
        &self,
        requester: NodeId,
        target: NodeId,
        addr: &str,
    ) -> ClusterResult<Vec<u8>> {
        let mut client = ReplicaServiceClient::new(self.channel(target, addr)?);
        let response = client.get_state(GetStateRequest { requester }).await?;
        Ok(response.into_inner().state)
    }

    /// Probe a peer, announcing the local member to it.
    pub async fn ping(
        &self,
        local: &Member,
        target: NodeId,
        addr: &str,
    ) -> ClusterResult<PingResponse> {
        let mut client = ReplicaServiceClient::new(self.channel(target, addr)?);
        let response = client
            .ping(PingRequest {
                from: local.node_id,
                address: local.addr.clone(),
                started_at_ms: local.started_at_ms,
                ready: local.ready,
            })
            .await?;
        Ok(response.into_inner())
    }

    /// Ask the coordinator for a lock; returns once it is granted.
    pub async fn lock(
        &self,
        owner: LockOwner,
        target: NodeId,
        addr: &str,
        name: &str,
    ) -> ClusterResult<()> {
        let mut client = LockServiceClient::new(self.channel(target, addr)?);
        let response = client
            .lock(LockRequest {
                name: name.to_string(),
                owner: owner.node_id,
                ticket: owner.ticket,
            })
            .await?;

        if response.into_inner().granted {
            Ok(())
        } else {
            Err(ClusterError::Lock(format!("lock '{}' was not granted", name)))
        }
    }

    /// Release a lock at the coordinator that granted it.
    pub async fn unlock(
        &self,
        owner: LockOwner,
        target: NodeId,
        addr: &str,
        name: &str,
    ) -> ClusterResult<bool> {
        self.send_unlock(owner, target, addr, name, false).await
    }

    /// Withdraw a lock request the caller stopped waiting for. Returns
    /// whether a grant had already been made and was released.
    pub async fn revoke(
        &self,
        owner: LockOwner,
        target: NodeId,
        addr: &str,
        name: &str,
    ) -> ClusterResult<bool> {
        self.send_unlock(owner, target, addr, name, true).await
    }

    async fn send_unlock(
        &self,
        owner: LockOwner,
        target: NodeId,
        addr: &str,
        name: &str,
        revoke: bool,
    ) -> ClusterResult<bool> {
        let mut client = LockServiceClient::new(self.channel(target, addr)?);
        let response = client
            .unlock(UnlockRequest {
                name: name.to_string(),
                owner: owner.node_id,
                ticket: owner.ticket,
                revoke,
            })
            .await?;
        Ok(response.into_inner().released)
    }

    /// Drop the cached channel to a node that left the view.
    pub fn forget(&self, target: NodeId) {
        self.connections.write().remove(&target);
    }
}
