//! gRPC servers for replica and lock RPCs.

use crate::command::ReplicaCommand;
use crate::error::ClusterError;
use crate::network::membership::Membership;
use crate::proto::lock_service_server::LockService;
use crate::proto::replica_service_server::ReplicaService;
use crate::proto::{
    GetStateRequest, GetStateResponse, InvokeRequest, InvokeResponse, LockRequest, LockResponse,
    PingRequest, PingResponse, UnlockRequest, UnlockResponse,
};
use crate::transport::{LockOwner, LockTable, ReplicaHandler};
use crate::types::{Member, NodeId, View};
use std::sync::Arc;
use tokio::sync::watch;
use tonic::{Request, Response, Status};

/// gRPC server delivering replica RPCs to the local handler.
///
/// Pings from peers are fed back into membership so a member that probes
/// us is in our view before its next request arrives.
pub struct ReplicaServer {
    membership: Arc<Membership>,
    handler: Arc<dyn ReplicaHandler>,
}

impl ReplicaServer {
    /// Create a new replica server.
    pub fn new(membership: Arc<Membership>, handler: Arc<dyn ReplicaHandler>) -> Self {
        Self {
            membership,
            handler,
        }
    }
}

#[tonic::async_trait]
impl ReplicaService for ReplicaServer {
    async fn invoke(
        &self,
        request: Request<InvokeRequest>,
    ) -> Result<Response<InvokeResponse>, Status> {
        let req = request.into_inner();
        let cmd: ReplicaCommand = serde_json::from_slice(&req.command)
            .map_err(|e| Status::invalid_argument(format!("Invalid command: {}", e)))?;

        tracing::debug!(origin = req.origin, command = cmd.name(), "invoking replica command");

        let resp = self.handler.handle(cmd).map_err(to_status)?;
        let response = serde_json::to_vec(&resp).map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(InvokeResponse { response }))
    }

    async fn get_state(
        &self,
        request: Request<GetStateRequest>,
    ) -> Result<Response<GetStateResponse>, Status> {
        let requester = request.into_inner().requester;
        tracing::info!(requester, "serving state transfer");

        let state = self.handler.serve_state().map_err(to_status)?;
        Ok(Response::new(GetStateResponse { state }))
    }

    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        let req = request.into_inner();
        self.membership.observe(Member {
            node_id: req.from,
            addr: req.address,
            started_at_ms: req.started_at_ms,
            ready: req.ready,
        });

        let local = self.membership.local_member();
        Ok(Response::new(PingResponse {
            node_id: local.node_id,
            address: local.addr,
            started_at_ms: local.started_at_ms,
            ready: local.ready,
        }))
    }
}

/// gRPC server for the lock table. Only grants locks while this node is
/// the coordinator of its current view.
pub struct LockServer {
    node_id: NodeId,
    locks: Arc<LockTable>,
    views: watch::Receiver<View>,
}

impl LockServer {
    /// Create a new lock server.
    pub fn new(node_id: NodeId, locks: Arc<LockTable>, views: watch::Receiver<View>) -> Self {
        Self {
            node_id,
            locks,
            views,
        }
    }

    fn is_coordinator(&self) -> bool {
        self.views.borrow().coordinator().map(|m| m.node_id) == Some(self.node_id)
    }
}

#[tonic::async_trait]
impl LockService for LockServer {
    async fn lock(&self, request: Request<LockRequest>) -> Result<Response<LockResponse>, Status> {
        let req = request.into_inner();
        if !self.is_coordinator() {
            return Err(Status::failed_precondition(format!(
                "node {} is not the lock coordinator",
                self.node_id
            )));
        }

        let owner = LockOwner::new(req.owner, req.ticket);
        tracing::debug!(lock = %req.name, owner = req.owner, ticket = req.ticket, "lock requested");
        let granted = self.locks.lock(&req.name, owner).await;

        Ok(Response::new(LockResponse { granted }))
    }

    async fn unlock(
        &self,
        request: Request<UnlockRequest>,
    ) -> Result<Response<UnlockResponse>, Status> {
        let req = request.into_inner();
        let owner = LockOwner::new(req.owner, req.ticket);
        if req.revoke {
            let released = self.locks.revoke(&req.name, owner);
            tracing::debug!(lock = %req.name, owner = req.owner, released, "lock request revoked");
            return Ok(Response::new(UnlockResponse { released }));
        }

        let released = self.locks.unlock(&req.name, owner);
        if !released {
            tracing::warn!(lock = %req.name, owner = req.owner, "unlock for a lock not held");
        }
        Ok(Response::new(UnlockResponse { released }))
    }
}

fn to_status(e: ClusterError) -> Status {
    match e {
        ClusterError::NotReady(_) => Status::unavailable(e.to_string()),
        ClusterError::InvalidInput(_) => Status::invalid_argument(e.to_string()),
        _ => Status::internal(e.to_string()),
    }
}
