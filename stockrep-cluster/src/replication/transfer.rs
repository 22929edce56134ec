//! Join-time state transfer.

use crate::error::{ClusterError, ClusterResult};
use crate::state::ReplicaEndpoint;
use crate::transport::GroupTransport;
use std::sync::Arc;
use std::time::Duration;

/// How a join completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// State was installed from a donor.
    Restored {
        /// Number of quotes received.
        stocks: usize,
    },
    /// No other ready member exists; this member starts the group empty.
    Founded,
}

/// Seeds a joining member's store from the coordinator.
pub struct StateTransfer {
    transport: Arc<dyn GroupTransport>,
    timeout: Duration,
}

impl StateTransfer {
    /// Create a transfer with a bounded wait.
    pub fn new(transport: Arc<dyn GroupTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Fetch state and install it into `endpoint`, then mark it ready.
    ///
    /// Expiry of the deadline is fatal: the endpoint stays not ready so the
    /// member never serves an unknown state as authoritative.
    pub async fn run(&self, endpoint: &ReplicaEndpoint) -> ClusterResult<TransferOutcome> {
        let node_id = self.transport.local_id();
        tracing::info!(node_id, timeout_ms = self.timeout.as_millis() as u64, "requesting state");

        let state = tokio::time::timeout(self.timeout, self.transport.request_state())
            .await
            .map_err(|_| ClusterError::StateTransferTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })??;

        let outcome = match state {
            Some(bytes) => {
                let stocks = endpoint
                    .set_state(&bytes)
                    .map_err(|e| ClusterError::StateTransfer(e.to_string()))?;
                TransferOutcome::Restored { stocks }
            }
            None => {
                tracing::info!(node_id, "no state donor, starting with an empty store");
                TransferOutcome::Founded
            }
        };

        endpoint.mark_ready();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ReplicatedStore;
    use crate::transport::{InMemoryNetwork, ReplicaHandler};
    use crate::types::NodeId;

    fn endpoint(node_id: NodeId) -> Arc<ReplicaEndpoint> {
        Arc::new(ReplicaEndpoint::new(node_id, Arc::new(ReplicatedStore::new())))
    }

    #[tokio::test]
    async fn test_founder_starts_empty() {
        let network = InMemoryNetwork::new();
        let a = endpoint(1);
        let transport = Arc::new(network.join(1, a.clone()).unwrap());

        let outcome = StateTransfer::new(transport, Duration::from_secs(1))
            .run(&a)
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Founded);
        assert!(a.is_ready());
        assert!(a.store().is_empty());
    }

    #[tokio::test]
    async fn test_joiner_copies_donor_exactly() {
        let network = InMemoryNetwork::new();
        let donor = endpoint(1);
        donor.mark_ready();
        donor.store().apply_set("AAPL", 100.0);
        donor.store().apply_set("MSFT", 200.0);
        network.join(1, donor.clone()).unwrap();

        let joiner = endpoint(2);
        joiner.store().apply_set("STALE", 3.0);
        let transport = Arc::new(network.join(2, joiner.clone()).unwrap());

        let outcome = StateTransfer::new(transport, Duration::from_secs(1))
            .run(&joiner)
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Restored { stocks: 2 });
        assert_eq!(joiner.store().snapshot(), donor.store().snapshot());
        assert!(joiner.is_ready());
    }

    #[tokio::test]
    async fn test_unreachable_donor_times_out() {
        let network = InMemoryNetwork::new();
        let donor = endpoint(1);
        donor.mark_ready();
        network.join(1, donor).unwrap();

        let joiner = endpoint(2);
        let transport = Arc::new(network.join(2, joiner.clone()).unwrap());
        network.isolate(2);

        let err = StateTransfer::new(transport, Duration::from_millis(50))
            .run(&joiner)
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::StateTransferTimeout { timeout_ms: 50 }));
        assert!(!joiner.is_ready());
    }
}
