//! Group transport over gRPC.

use crate::command::{ReplicaCommand, ReplicaResponse};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::network::client::PeerClients;
use crate::network::membership::Membership;
use crate::network::server::{LockServer, ReplicaServer};
use crate::proto::lock_service_server::LockServiceServer;
use crate::proto::replica_service_server::ReplicaServiceServer;
use crate::transport::{GroupTransport, LockOwner, LockTable, ReplicaHandler};
use crate::types::{Member, MemberReply, NodeId, Reply, Responses, View};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::Code;
use tonic::transport::Server;

struct Inner {
    node_id: NodeId,
    handler: Arc<dyn ReplicaHandler>,
    membership: Arc<Membership>,
    clients: PeerClients,
    /// Lock table served while this member is the coordinator.
    locks: Arc<LockTable>,
    /// Source of lock request tickets.
    tickets: AtomicU64,
    /// Locks this member holds, keyed by name, with the granting
    /// coordinator and the request it granted.
    held_locks: Mutex<HashMap<String, (Member, LockOwner)>>,
    rpc_timeout: Duration,
    retry_interval: Duration,
    stopped: AtomicBool,
}

/// A member of a replica group reached over gRPC.
///
/// Serves the replica and lock services on the configured listen address,
/// probes peers on a heartbeat to maintain the view, and hosts the lock
/// table whenever it is the view coordinator.
pub struct GrpcTransport {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl GrpcTransport {
    /// Bind the listen address, start serving and run the first probe round.
    pub async fn start(
        config: &ClusterConfig,
        handler: Arc<dyn ReplicaHandler>,
    ) -> ClusterResult<Self> {
        let node_id = config.node_id;
        let started_at_ms = now_ms();

        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let advertise_addr = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());

        let clients = PeerClients::new(config.connect_timeout());
        let membership = Arc::new(Membership::new(
            node_id,
            advertise_addr.clone(),
            started_at_ms,
            config.peers.clone(),
            clients.clone(),
            config.probe_timeout(),
            Arc::clone(&handler),
        ));
        let locks = Arc::new(LockTable::new());

        let replica_server = ReplicaServer::new(Arc::clone(&membership), Arc::clone(&handler));
        let lock_server = LockServer::new(node_id, Arc::clone(&locks), membership.subscribe());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = Server::builder()
                .add_service(ReplicaServiceServer::new(replica_server))
                .add_service(LockServiceServer::new(lock_server))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(node_id, error = %e, "replica server stopped");
            }
        });

        let inner = Arc::new(Inner {
            node_id,
            handler,
            membership,
            clients,
            locks,
            tickets: AtomicU64::new(0),
            held_locks: Mutex::new(HashMap::new()),
            rpc_timeout: config.rpc_timeout(),
            retry_interval: config.heartbeat_interval(),
            stopped: AtomicBool::new(false),
        });

        inner.refresh_view().await;
        let heartbeat = spawn_heartbeat(Arc::downgrade(&inner), config.heartbeat_interval());

        tracing::info!(
            node_id,
            cluster = %config.cluster_name,
            addr = %local_addr,
            advertise = %advertise_addr,
            "replica transport started"
        );

        Ok(Self {
            inner,
            local_addr,
            heartbeat: Mutex::new(Some(heartbeat)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run a probe round now instead of waiting for the next heartbeat.
    pub async fn refresh_view(&self) -> View {
        self.inner.refresh_view().await;
        self.inner.membership.view()
    }

    fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
    }
}

impl Drop for GrpcTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn ensure_running(&self) -> ClusterResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(ClusterError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Probe peers; as coordinator, free the locks of members that left.
    /// Channels to departed members are dropped either way.
    async fn refresh_view(&self) {
        let change = self.membership.probe().await;
        if change.is_empty() {
            return;
        }

        let view = self.membership.view();
        tracing::debug!(
            node_id = self.node_id,
            %view,
            joined = ?change.joined,
            left = ?change.left,
            "view changed"
        );

        let coordinating = view.coordinator().map(|m| m.node_id) == Some(self.node_id);
        for departed in change.left {
            self.clients.forget(departed);
            if coordinating {
                self.locks.release_owner(departed);
            }
        }
    }

    async fn invoke_member(&self, member: &Member, cmd: &ReplicaCommand) -> Reply<ReplicaResponse> {
        if member.node_id == self.node_id {
            return match self.handler.handle(cmd.clone()) {
                Ok(resp) => Reply::Value(resp),
                Err(ClusterError::NotReady(_)) => Reply::Unavailable("not ready".to_string()),
                Err(e) => Reply::Error(e.to_string()),
            };
        }

        let call = self
            .clients
            .invoke(self.node_id, member.node_id, &member.addr, cmd);
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(Ok(resp)) => Reply::Value(resp),
            Ok(Err(ClusterError::Network(status))) if status.code() == Code::Unavailable => {
                Reply::Unavailable(status.message().to_string())
            }
            Ok(Err(ClusterError::Transport(e))) => Reply::Unavailable(e.to_string()),
            Ok(Err(e)) => Reply::Error(e.to_string()),
            Err(_) => Reply::TimedOut,
        }
    }
}

/// A remote lock request in flight. If the caller stops waiting before the
/// grant arrives, the request is revoked at the coordinator so a late grant
/// does not hold the lock forever.
struct PendingLock {
    clients: PeerClients,
    coordinator: Member,
    name: String,
    owner: LockOwner,
    armed: bool,
}

impl Drop for PendingLock {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let clients = self.clients.clone();
        let coordinator = self.coordinator.clone();
        let name = std::mem::take(&mut self.name);
        let owner = self.owner;
        runtime.spawn(async move {
            let revoked = clients
                .revoke(owner, coordinator.node_id, &coordinator.addr, &name)
                .await;
            match revoked {
                Ok(released) => {
                    tracing::debug!(lock = %name, released, "abandoned lock request revoked");
                }
                Err(e) => {
                    tracing::warn!(
                        lock = %name,
                        error = %e,
                        "failed to revoke abandoned lock request"
                    );
                }
            }
        });
    }
}

fn spawn_heartbeat(inner: Weak<Inner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; start() already probed.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.refresh_view().await;
        }
    })
}

#[async_trait]
impl GroupTransport for GrpcTransport {
    fn local_id(&self) -> NodeId {
        self.inner.node_id
    }

    fn view(&self) -> View {
        self.inner.membership.view()
    }

    fn subscribe_views(&self) -> watch::Receiver<View> {
        self.inner.membership.subscribe()
    }

    async fn broadcast(&self, cmd: ReplicaCommand) -> ClusterResult<Responses<ReplicaResponse>> {
        self.inner.ensure_running()?;
        let view = self.inner.membership.view();

        let calls = view.members.iter().map(|member| {
            let inner = &self.inner;
            let cmd = &cmd;
            async move {
                MemberReply {
                    member: member.node_id,
                    reply: inner.invoke_member(member, cmd).await,
                }
            }
        });

        Ok(Responses::new(join_all(calls).await))
    }

    async fn request_state(&self) -> ClusterResult<Option<Vec<u8>>> {
        let inner = &self.inner;
        inner.ensure_running()?;

        loop {
            inner.refresh_view().await;
            let view = inner.membership.view();
            let Some(donor) = view.state_donor(inner.node_id).cloned() else {
                return Ok(None);
            };

            tracing::debug!(node_id = inner.node_id, donor = donor.node_id, "requesting state");
            match inner
                .clients
                .get_state(inner.node_id, donor.node_id, &donor.addr)
                .await
            {
                Ok(state) => return Ok(Some(state)),
                Err(e) => {
                    // The caller bounds the total wait.
                    tracing::warn!(
                        donor = donor.node_id,
                        error = %e,
                        "state request failed, retrying"
                    );
                    tokio::time::sleep(inner.retry_interval).await;
                }
            }
        }
    }

    async fn acquire_lock(&self, name: &str) -> ClusterResult<()> {
        let inner = &self.inner;
        inner.ensure_running()?;

        loop {
            let view = inner.membership.view();
            let coordinator = view
                .coordinator()
                .cloned()
                .ok_or(ClusterError::NodeNotFound(inner.node_id))?;

            let ticket = inner.tickets.fetch_add(1, Ordering::Relaxed);
            let owner = LockOwner::new(inner.node_id, ticket);
            let granted = if coordinator.node_id == inner.node_id {
                if inner.locks.lock(name, owner).await {
                    Ok(())
                } else {
                    Err(ClusterError::Lock(format!("lock '{}' request was revoked", name)))
                }
            } else {
                let mut pending = PendingLock {
                    clients: inner.clients.clone(),
                    coordinator: coordinator.clone(),
                    name: name.to_string(),
                    owner,
                    armed: true,
                };
                let granted = inner
                    .clients
                    .lock(owner, coordinator.node_id, &coordinator.addr, name)
                    .await;
                // The coordinator answered; nothing is left to revoke.
                pending.armed = false;
                granted
            };

            match granted {
                Ok(()) => {
                    tracing::debug!(lock = name, coordinator = coordinator.node_id, "lock acquired");
                    inner
                        .held_locks
                        .lock()
                        .insert(name.to_string(), (coordinator, owner));
                    return Ok(());
                }
                Err(ClusterError::Network(status))
                    if matches!(status.code(), Code::Unavailable | Code::FailedPrecondition) =>
                {
                    // Coordinator moved or is gone; wait for the view to settle.
                    tracing::debug!(
                        lock = name,
                        coordinator = coordinator.node_id,
                        "lock coordinator unavailable, retrying"
                    );
                    tokio::time::sleep(inner.retry_interval).await;
                    inner.refresh_view().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn release_lock(&self, name: &str) -> ClusterResult<()> {
        let inner = &self.inner;
        let (coordinator, owner) = inner.held_locks.lock().remove(name).ok_or_else(|| {
            ClusterError::Lock(format!("lock '{}' is not held by node {}", name, inner.node_id))
        })?;

        let released = if coordinator.node_id == inner.node_id {
            inner.locks.unlock(name, owner)
        } else {
            inner
                .clients
                .unlock(owner, coordinator.node_id, &coordinator.addr, name)
                .await?
        };

        if released {
            Ok(())
        } else {
            Err(ClusterError::Lock(format!(
                "coordinator {} did not hold lock '{}' for node {}",
                coordinator.node_id, name, inner.node_id
            )))
        }
    }

    async fn shutdown(&self) -> ClusterResult<()> {
        self.stop();
        tracing::info!(node_id = self.inner.node_id, "replica transport shut down");
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
