//! ReplicaNode - the main entry point for replica operations.

use crate::command::{ReplicaResponse, parse_symbol};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::network::GrpcTransport;
use crate::replication::{
    CasCoordinator, CasOutcome, StateTransfer, TransferOutcome, UpdateBroadcaster,
};
use crate::state::{ReplicaEndpoint, ReplicatedStore};
use crate::transport::{GroupTransport, ReplicaHandler};
use crate::types::{NodeId, QuorumPolicy, Responses, View};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Timing and quorum settings for [`ReplicaNode::join`].
#[derive(Debug, Clone, Copy)]
pub struct NodeOptions {
    /// Bound on waiting for state at join time.
    pub state_transfer_timeout: Duration,
    /// Bound on distributed lock acquisition; `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// How compare-and-swap sizes its majority.
    pub quorum: QuorumPolicy,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            state_transfer_timeout: Duration::from_secs(30),
            lock_timeout: None,
            quorum: QuorumPolicy::default(),
        }
    }
}

impl From<&ClusterConfig> for NodeOptions {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            state_transfer_timeout: config.state_transfer_timeout(),
            lock_timeout: config.lock_timeout(),
            quorum: config.quorum,
        }
    }
}

/// A member of the replicated quote group.
///
/// Reads are served from the local store. Writes are broadcast to every
/// member, this one included, and only change the local store when the
/// broadcast delivers them here.
pub struct ReplicaNode {
    node_id: NodeId,
    endpoint: Arc<ReplicaEndpoint>,
    transport: Arc<dyn GroupTransport>,
    broadcaster: UpdateBroadcaster,
    cas: CasCoordinator,
    transfer: TransferOutcome,
    view_logger: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaNode {
    /// Start a node over gRPC and join the group described by `config`.
    pub async fn start(config: ClusterConfig) -> ClusterResult<Self> {
        config.validate().map_err(ClusterError::Config)?;

        let store = Arc::new(ReplicatedStore::new());
        let endpoint = Arc::new(ReplicaEndpoint::new(config.node_id, store));

        let handler: Arc<dyn ReplicaHandler> = Arc::clone(&endpoint) as _;
        let transport = GrpcTransport::start(&config, handler).await?;

        Self::join(endpoint, Arc::new(transport), NodeOptions::from(&config)).await
    }

    /// Join a group over an already-connected transport.
    ///
    /// Fetches state from the longest-lived ready member (or founds the
    /// group if there is none), then starts serving. A state transfer
    /// failure is returned after leaving the group again.
    pub async fn join(
        endpoint: Arc<ReplicaEndpoint>,
        transport: Arc<dyn GroupTransport>,
        options: NodeOptions,
    ) -> ClusterResult<Self> {
        let node_id = transport.local_id();
        let view_logger = spawn_view_logger(node_id, transport.subscribe_views());

        let transfer = StateTransfer::new(Arc::clone(&transport), options.state_transfer_timeout);
        let transfer = match transfer.run(&endpoint).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(node_id, error = %e, "state transfer failed");
                view_logger.abort();
                if let Err(shutdown_err) = transport.shutdown().await {
                    tracing::warn!(node_id, error = %shutdown_err, "failed to leave group");
                }
                return Err(e);
            }
        };

        let broadcaster = UpdateBroadcaster::new(Arc::clone(&transport));
        let cas = CasCoordinator::new(Arc::clone(&transport))
            .with_policy(options.quorum)
            .with_lock_timeout(options.lock_timeout);

        tracing::info!(node_id, ?transfer, stocks = endpoint.store().len(), "replica node joined");

        Ok(Self {
            node_id,
            endpoint,
            transport,
            broadcaster,
            cas,
            transfer,
            view_logger: Mutex::new(Some(view_logger)),
        })
    }

    /// This node's ID.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// How this node obtained its initial state.
    pub fn transfer_outcome(&self) -> TransferOutcome {
        self.transfer
    }

    /// The local store.
    pub fn store(&self) -> &Arc<ReplicatedStore> {
        self.endpoint.store()
    }

    /// All local quotes, sorted by symbol.
    pub fn stocks(&self) -> Vec<(String, f64)> {
        self.store().entries()
    }

    /// Local price of a symbol.
    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.store().get(symbol)
    }

    /// Set a quote on every member.
    pub async fn set(&self, symbol: &str, price: f64) -> ClusterResult<Responses<ReplicaResponse>> {
        let symbol = parse_symbol(symbol)?;
        if !price.is_finite() {
            return Err(ClusterError::InvalidInput(format!(
                "'{}' is not a finite price",
                price
            )));
        }
        self.broadcaster.set(&symbol, price).await
    }

    /// Remove a quote from every member.
    pub async fn remove(&self, symbol: &str) -> ClusterResult<Responses<ReplicaResponse>> {
        let symbol = parse_symbol(symbol)?;
        self.broadcaster.remove(&symbol).await
    }

    /// Cluster-wide compare-and-swap on client input.
    ///
    /// An empty `reference` means the symbol is expected to be absent.
    pub async fn compare_and_swap(
        &self,
        symbol: &str,
        reference: &str,
        new_value: &str,
    ) -> ClusterResult<CasOutcome> {
        self.cas.compare_and_swap(symbol, reference, new_value).await
    }

    /// Cluster-wide compare-and-swap on parsed values.
    pub async fn compare_and_swap_values(
        &self,
        symbol: &str,
        reference: Option<f64>,
        new_value: f64,
    ) -> ClusterResult<CasOutcome> {
        let symbol = parse_symbol(symbol)?;
        self.cas.execute(&symbol, reference, new_value).await
    }

    /// The current membership view.
    pub fn view(&self) -> View {
        self.transport.view()
    }

    /// Subscribe to membership view changes.
    pub fn subscribe_views(&self) -> watch::Receiver<View> {
        self.transport.subscribe_views()
    }

    /// Leave the group.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        let logger = self.view_logger.lock().take();
        if let Some(task) = logger {
            task.abort();
        }
        self.transport.shutdown().await?;
        tracing::info!(node_id = self.node_id, "replica node shut down");
        Ok(())
    }
}

impl Drop for ReplicaNode {
    fn drop(&mut self) {
        if let Some(task) = self.view_logger.lock().take() {
            task.abort();
        }
    }
}

fn spawn_view_logger(node_id: NodeId, mut views: watch::Receiver<View>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = views.borrow_and_update().clone();
        tracing::info!(node_id, view = %last, "-- VIEW");

        while views.changed().await.is_ok() {
            let view = views.borrow_and_update().clone();
            if view.id != last.id {
                tracing::info!(node_id, view = %view, "-- VIEW");
            }
            last = view;
        }
    })
}
