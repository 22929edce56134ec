//! Unconditional updates broadcast to every member.

use crate::command::{ReplicaCommand, ReplicaResponse};
use crate::error::ClusterResult;
use crate::transport::GroupTransport;
use crate::types::Responses;
use std::sync::Arc;

/// Turns local set/remove requests into synchronous broadcasts.
///
/// No lock is taken and no order is imposed between broadcasts issued by
/// different members: concurrent conflicting writes to one symbol may be
/// applied in different orders on different replicas.
#[derive(Clone)]
pub struct UpdateBroadcaster {
    transport: Arc<dyn GroupTransport>,
}

impl UpdateBroadcaster {
    /// Create a broadcaster over a transport.
    pub fn new(transport: Arc<dyn GroupTransport>) -> Self {
        Self { transport }
    }

    /// Set a quote on every member.
    pub async fn set(&self, symbol: &str, price: f64) -> ClusterResult<Responses<ReplicaResponse>> {
        self.send(ReplicaCommand::ApplySet {
            symbol: symbol.to_string(),
            price,
        })
        .await
    }

    /// Remove a quote from every member.
    pub async fn remove(&self, symbol: &str) -> ClusterResult<Responses<ReplicaResponse>> {
        self.send(ReplicaCommand::ApplyRemove {
            symbol: symbol.to_string(),
        })
        .await
    }

    async fn send(&self, cmd: ReplicaCommand) -> ClusterResult<Responses<ReplicaResponse>> {
        let name = cmd.name();
        let symbol = cmd.symbol().to_string();

        let responses = self.transport.broadcast(cmd).await?;

        tracing::debug!(
            command = name,
            %symbol,
            members = responses.len(),
            received = responses.num_received(),
            "broadcast complete"
        );
        if responses.num_received() < responses.len() {
            tracing::warn!(
                command = name,
                %symbol,
                missing = responses.len() - responses.num_received(),
                "some members did not respond"
            );
        }

        Ok(responses)
    }
}
