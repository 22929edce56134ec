//! In-process group transport.
//!
//! All members live in one process and share an [`InMemoryNetwork`] hub.
//! Join order defines the view (the first member is the coordinator), the
//! hub hosts the lock table, and members can be isolated to simulate
//! unreachable nodes.

use crate::command::{ReplicaCommand, ReplicaResponse};
use crate::error::{ClusterError, ClusterResult};
use crate::types::{Member, MemberReply, NodeId, Reply, Responses, View};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use super::lock::{LockOwner, LockTable};
use super::{GroupTransport, ReplicaHandler};

struct Slot {
    node_id: NodeId,
    joined_seq: u64,
    handler: Arc<dyn ReplicaHandler>,
    isolated: bool,
}

struct Registry {
    slots: Vec<Slot>,
    next_seq: u64,
    view_id: u64,
}

impl Registry {
    fn members(&self) -> Vec<Member> {
        self.slots
            .iter()
            .map(|s| Member {
                node_id: s.node_id,
                addr: String::new(),
                started_at_ms: s.joined_seq,
                ready: s.handler.is_ready(),
            })
            .collect()
    }
}

struct NetworkInner {
    registry: RwLock<Registry>,
    views: watch::Sender<View>,
    locks: LockTable,
}

/// Hub connecting in-memory members.
#[derive(Clone)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        let (views, _) = watch::channel(View::default());
        Self {
            inner: Arc::new(NetworkInner {
                registry: RwLock::new(Registry {
                    slots: Vec::new(),
                    next_seq: 0,
                    view_id: 0,
                }),
                views,
                locks: LockTable::new(),
            }),
        }
    }

    /// Join a member and return its transport endpoint.
    pub fn join(
        &self,
        node_id: NodeId,
        handler: Arc<dyn ReplicaHandler>,
    ) -> ClusterResult<InMemoryTransport> {
        {
            let mut registry = self.inner.registry.write();
            if registry.slots.iter().any(|s| s.node_id == node_id) {
                return Err(ClusterError::Config(format!(
                    "node {} already joined",
                    node_id
                )));
            }
            let joined_seq = registry.next_seq;
            registry.next_seq += 1;
            registry.slots.push(Slot {
                node_id,
                joined_seq,
                handler,
                isolated: false,
            });
        }
        self.publish_view();

        Ok(InMemoryTransport {
            node_id,
            network: self.clone(),
            tickets: Arc::new(AtomicU64::new(0)),
            held: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Remove a member from the view and free the locks it held.
    pub fn leave(&self, node_id: NodeId) {
        let removed = {
            let mut registry = self.inner.registry.write();
            let before = registry.slots.len();
            registry.slots.retain(|s| s.node_id != node_id);
            registry.slots.len() != before
        };
        if removed {
            self.inner.locks.release_owner(node_id);
            self.publish_view();
        }
    }

    /// Cut a member off: it stays in the view but nothing reaches it and
    /// it reaches no one but itself.
    pub fn isolate(&self, node_id: NodeId) {
        self.set_isolated(node_id, true);
    }

    /// Undo [`isolate`](Self::isolate).
    pub fn heal(&self, node_id: NodeId) {
        self.set_isolated(node_id, false);
    }

    /// The lock table hosted by this network.
    pub fn locks(&self) -> &LockTable {
        &self.inner.locks
    }

    /// The current view, with each member's readiness as of now.
    pub fn view(&self) -> View {
        self.refresh_readiness();
        self.inner.views.borrow().clone()
    }

    fn set_isolated(&self, node_id: NodeId, isolated: bool) {
        let mut registry = self.inner.registry.write();
        if let Some(slot) = registry.slots.iter_mut().find(|s| s.node_id == node_id) {
            slot.isolated = isolated;
        }
    }

    fn publish_view(&self) {
        let view = {
            let mut registry = self.inner.registry.write();
            registry.view_id += 1;
            View::new(registry.view_id, registry.members())
        };
        self.inner.views.send_replace(view);
    }

    /// Republish the view in place when a member's readiness changed. The
    /// view id stays the same since the member set did not change.
    fn refresh_readiness(&self) {
        let members = self.inner.registry.read().members();
        self.inner.views.send_if_modified(|view| {
            let next = View::new(view.id, members);
            if next.members == view.members {
                return false;
            }
            *view = next;
            true
        });
    }

    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let registry = self.inner.registry.read();
        let isolated = |id: NodeId| {
            registry
                .slots
                .iter()
                .find(|s| s.node_id == id)
                .map(|s| s.isolated)
                .unwrap_or(true)
        };
        !isolated(from) && !isolated(to)
    }

    fn is_member(&self, node_id: NodeId) -> bool {
        self.inner
            .registry
            .read()
            .slots
            .iter()
            .any(|s| s.node_id == node_id)
    }

    fn handlers(&self) -> Vec<(NodeId, Arc<dyn ReplicaHandler>)> {
        self.inner
            .registry
            .read()
            .slots
            .iter()
            .map(|s| (s.node_id, Arc::clone(&s.handler)))
            .collect()
    }
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's endpoint on an [`InMemoryNetwork`].
#[derive(Clone)]
pub struct InMemoryTransport {
    node_id: NodeId,
    network: InMemoryNetwork,
    tickets: Arc<AtomicU64>,
    /// Locks held by this member, with the request that was granted.
    held: Arc<Mutex<HashMap<String, LockOwner>>>,
}

impl InMemoryTransport {
    /// The network this transport belongs to.
    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl GroupTransport for InMemoryTransport {
    fn local_id(&self) -> NodeId {
        self.node_id
    }

    fn view(&self) -> View {
        self.network.view()
    }

    fn subscribe_views(&self) -> watch::Receiver<View> {
        self.network.inner.views.subscribe()
    }

    async fn broadcast(&self, cmd: ReplicaCommand) -> ClusterResult<Responses<ReplicaResponse>> {
        if !self.network.is_member(self.node_id) {
            return Err(ClusterError::Shutdown);
        }
        let mut replies = Vec::new();

        for (member, handler) in self.network.handlers() {
            let reply = if !self.network.reachable(self.node_id, member) {
                Reply::Unavailable("unreachable".to_string())
            } else {
                match handler.handle(cmd.clone()) {
                    Ok(resp) => Reply::Value(resp),
                    Err(ClusterError::NotReady(_)) => Reply::Unavailable("not ready".to_string()),
                    Err(e) => Reply::Error(e.to_string()),
                }
            };
            replies.push(MemberReply { member, reply });
        }

        Ok(Responses::new(replies))
    }

    async fn request_state(&self) -> ClusterResult<Option<Vec<u8>>> {
        // Handlers are listed in join order, so the first ready one other
        // than ourselves is the longest-lived member.
        let donor = self
            .network
            .handlers()
            .into_iter()
            .find(|(id, handler)| *id != self.node_id && handler.is_ready());

        let Some((donor_id, handler)) = donor else {
            return Ok(None);
        };

        if !self.network.reachable(self.node_id, donor_id) {
            // A real transport would block until the deadline.
            return std::future::pending().await;
        }

        tracing::debug!(node_id = self.node_id, donor_id, "requesting state");
        handler.serve_state().map(Some)
    }

    async fn acquire_lock(&self, name: &str) -> ClusterResult<()> {
        if !self.network.is_member(self.node_id) {
            return Err(ClusterError::Shutdown);
        }
        let owner = LockOwner::new(self.node_id, self.tickets.fetch_add(1, Ordering::Relaxed));

        // The grant and the bookkeeping happen in the poll that completes
        // the wait, so a cancelled acquisition never holds the lock.
        if !self.network.inner.locks.lock(name, owner).await {
            return Err(ClusterError::Lock(format!("lock '{}' was revoked", name)));
        }
        self.held.lock().insert(name.to_string(), owner);
        Ok(())
    }

    async fn release_lock(&self, name: &str) -> ClusterResult<()> {
        let released = self
            .held
            .lock()
            .remove(name)
            .is_some_and(|owner| self.network.inner.locks.unlock(name, owner));

        if released {
            Ok(())
        } else {
            Err(ClusterError::Lock(format!(
                "lock '{}' is not held by node {}",
                name, self.node_id
            )))
        }
    }

    async fn shutdown(&self) -> ClusterResult<()> {
        self.network.leave(self.node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ReplicaEndpoint, ReplicatedStore};

    fn ready_endpoint(node_id: NodeId) -> Arc<ReplicaEndpoint> {
        let endpoint = Arc::new(ReplicaEndpoint::new(node_id, Arc::new(ReplicatedStore::new())));
        endpoint.mark_ready();
        endpoint
    }

    #[tokio::test]
    async fn test_view_follows_join_order() {
        let network = InMemoryNetwork::new();
        let _a = network.join(3, ready_endpoint(3)).unwrap();
        let _b = network.join(1, ready_endpoint(1)).unwrap();

        let view = network.view();
        assert_eq!(view.member_ids(), vec![3, 1]);
        assert_eq!(view.coordinator().map(|m| m.node_id), Some(3));

        assert!(network.join(1, ready_endpoint(1)).is_err());

        network.leave(3);
        assert_eq!(network.view().member_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_view_reports_readiness_after_join() {
        let network = InMemoryNetwork::new();
        let _a = network.join(1, ready_endpoint(1)).unwrap();
        let joining = Arc::new(ReplicaEndpoint::new(2, Arc::new(ReplicatedStore::new())));
        let b = network.join(2, joining.clone()).unwrap();
        let mut views = b.subscribe_views();
        views.borrow_and_update();

        let view = b.view();
        assert_eq!(view.id, 2);
        assert!(view.members[0].ready);
        assert!(!view.members[1].ready);

        joining.mark_ready();
        let view = b.view();
        assert_eq!(view.id, 2);
        assert!(view.members.iter().all(|m| m.ready));
        assert!(views.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_reports_isolated_member() {
        let network = InMemoryNetwork::new();
        let a = network.join(1, ready_endpoint(1)).unwrap();
        let _b = network.join(2, ready_endpoint(2)).unwrap();
        network.isolate(2);

        let responses = a
            .broadcast(ReplicaCommand::ApplySet {
                symbol: "AAPL".to_string(),
                price: 1.0,
            })
            .await
            .unwrap();

        assert_eq!(responses.len(), 2);
        assert_eq!(responses.num_received(), 1);
        assert!(matches!(responses.get(2), Some(Reply::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_request_state_without_donor() {
        let network = InMemoryNetwork::new();
        let a = network.join(1, ready_endpoint(1)).unwrap();
        assert_eq!(a.request_state().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_left_member_cannot_broadcast() {
        let network = InMemoryNetwork::new();
        let a = network.join(1, ready_endpoint(1)).unwrap();
        let _b = network.join(2, ready_endpoint(2)).unwrap();
        a.shutdown().await.unwrap();

        let result = a
            .broadcast(ReplicaCommand::ApplyRemove {
                symbol: "AAPL".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ClusterError::Shutdown)));
        assert!(matches!(
            a.acquire_lock("lock AAPL").await,
            Err(ClusterError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_release_unheld_lock_fails() {
        let network = InMemoryNetwork::new();
        let a = network.join(1, ready_endpoint(1)).unwrap();
        assert!(matches!(
            a.release_lock("lock AAPL").await,
            Err(ClusterError::Lock(_))
        ));
    }
}
