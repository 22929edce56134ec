//! Group communication seen from the replica core.
//!
//! The core never talks to the network directly. It consumes four narrow
//! capabilities through [`GroupTransport`]:
//!
//! - broadcast a command to every member and collect per-member replies
//! - observe membership views
//! - fetch state from a donor at join time
//! - acquire and release named cluster-wide locks
//!
//! In the other direction the transport delivers incoming requests to the
//! local member through [`ReplicaHandler`].
//!
//! Two implementations exist: [`InMemoryNetwork`] for tests and embedding,
//! and the gRPC transport in [`crate::network`].

mod lock;
mod memory;

pub use lock::{LockOwner, LockTable};
pub use memory::{InMemoryNetwork, InMemoryTransport};

use crate::command::{ReplicaCommand, ReplicaResponse};
use crate::error::ClusterResult;
use crate::types::{NodeId, Responses, View};
use async_trait::async_trait;
use tokio::sync::watch;

/// Receives requests delivered by the transport to the local member.
///
/// Implementations must not block on network I/O: they are invoked from
/// transport handler tasks concurrently with local client activity.
pub trait ReplicaHandler: Send + Sync + 'static {
    /// Apply a replicated command to the local store.
    fn handle(&self, cmd: ReplicaCommand) -> ClusterResult<ReplicaResponse>;

    /// Serialize the local store for a joining member.
    fn serve_state(&self) -> ClusterResult<Vec<u8>>;

    /// Whether this member has finished joining.
    fn is_ready(&self) -> bool;
}

/// The group communication primitives the replica core depends on.
#[async_trait]
pub trait GroupTransport: Send + Sync + 'static {
    /// This member's node ID.
    fn local_id(&self) -> NodeId;

    /// The current membership view.
    fn view(&self) -> View;

    /// Subscribe to membership view changes.
    fn subscribe_views(&self) -> watch::Receiver<View>;

    /// Invoke a command on every member of the current view, including this
    /// one, and wait for each reply or its timeout.
    async fn broadcast(&self, cmd: ReplicaCommand) -> ClusterResult<Responses<ReplicaResponse>>;

    /// Fetch the serialized state of the coordinator.
    ///
    /// Returns `None` when there is no other ready member to fetch from,
    /// i.e. this member founds the group.
    async fn request_state(&self) -> ClusterResult<Option<Vec<u8>>>;

    /// Block until the named cluster-wide lock is held by this member.
    async fn acquire_lock(&self, name: &str) -> ClusterResult<()>;

    /// Release a lock previously acquired by this member.
    async fn release_lock(&self, name: &str) -> ClusterResult<()>;

    /// Leave the group.
    async fn shutdown(&self) -> ClusterResult<()>;
}
