//! Heartbeat-driven membership views.
//!
//! Every member probes every configured peer on a fixed interval. Peers
//! that answer within the probe timeout form the view together with the
//! local member; the view is ordered by start time so all members that can
//! see each other agree on the coordinator.
//!
//! Probes describe the prober, so a member that pings us joins our view
//! immediately instead of at our next probe round. A joining member pings
//! everyone before it asks for state, which puts it in every reachable
//! member's broadcasts before its snapshot is taken.

use crate::network::client::PeerClients;
use crate::transport::ReplicaHandler;
use crate::types::{Member, NodeId, View};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Membership changes produced by one probe round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ViewChange {
    /// Members that appeared.
    pub joined: Vec<NodeId>,
    /// Members that disappeared.
    pub left: Vec<NodeId>,
}

impl ViewChange {
    /// Whether the member set changed.
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Failure detector and view publisher for one member.
pub struct Membership {
    node_id: NodeId,
    advertise_addr: String,
    started_at_ms: u64,
    peers: HashMap<NodeId, String>,
    clients: PeerClients,
    probe_timeout: Duration,
    handler: Arc<dyn ReplicaHandler>,
    views: watch::Sender<View>,
    /// Members that pinged us, with when we last heard from them.
    announced: Mutex<HashMap<NodeId, (Member, Instant)>>,
    /// Start of the previous probe round.
    last_round: Mutex<Instant>,
}

impl Membership {
    /// Create a membership tracker whose initial view holds only this member.
    pub fn new(
        node_id: NodeId,
        advertise_addr: String,
        started_at_ms: u64,
        peers: HashMap<NodeId, String>,
        clients: PeerClients,
        probe_timeout: Duration,
        handler: Arc<dyn ReplicaHandler>,
    ) -> Self {
        let local = Member {
            node_id,
            addr: advertise_addr.clone(),
            started_at_ms,
            ready: handler.is_ready(),
        };
        let (views, _) = watch::channel(View::new(1, vec![local]));

        Self {
            node_id,
            advertise_addr,
            started_at_ms,
            peers,
            clients,
            probe_timeout,
            handler,
            views,
            announced: Mutex::new(HashMap::new()),
            last_round: Mutex::new(Instant::now()),
        }
    }

    /// The current view.
    pub fn view(&self) -> View {
        self.views.borrow().clone()
    }

    /// Subscribe to view changes.
    pub fn subscribe(&self) -> watch::Receiver<View> {
        self.views.subscribe()
    }

    pub(crate) fn local_member(&self) -> Member {
        Member {
            node_id: self.node_id,
            addr: self.advertise_addr.clone(),
            started_at_ms: self.started_at_ms,
            ready: self.handler.is_ready(),
        }
    }

    /// Probe all peers once and publish the resulting view.
    ///
    /// Members that announced themselves since the previous round started
    /// stay in the view even if this round did not reach them.
    pub async fn probe(&self) -> ViewChange {
        let round_start = Instant::now();
        let since = std::mem::replace(&mut *self.last_round.lock(), round_start);

        let local = self.local_member();
        let probes = self
            .peers
            .iter()
            .filter(|(id, _)| **id != self.node_id)
            .map(|(id, addr)| self.probe_peer(&local, *id, addr));

        let mut members: Vec<Member> = join_all(probes).await.into_iter().flatten().collect();
        members.push(local);

        let mut announced = self.announced.lock();
        announced.retain(|_, (_, heard_at)| *heard_at >= since);
        for (member, _) in announced.values() {
            if !members.iter().any(|m| m.node_id == member.node_id) {
                members.push(member.clone());
            }
        }
        drop(announced);

        self.publish(members)
    }

    /// Record a member that pinged us and add it to the view right away.
    pub fn observe(&self, member: Member) -> ViewChange {
        if member.node_id == self.node_id || member.addr.is_empty() {
            return ViewChange::default();
        }
        self.announced
            .lock()
            .insert(member.node_id, (member.clone(), Instant::now()));

        let change = self.update(|view| {
            let mut members: Vec<Member> = view
                .members
                .iter()
                .filter(|m| m.node_id != member.node_id)
                .cloned()
                .collect();
            members.push(member);
            members
        });
        if !change.is_empty() {
            tracing::debug!(node_id = self.node_id, joined = ?change.joined, "member announced itself");
        }
        change
    }

    async fn probe_peer(&self, local: &Member, peer: NodeId, addr: &str) -> Option<Member> {
        let ping = self.clients.ping(local, peer, addr);
        match tokio::time::timeout(self.probe_timeout, ping).await {
            Ok(Ok(resp)) if resp.node_id == peer => Some(Member {
                node_id: peer,
                addr: addr.to_string(),
                started_at_ms: resp.started_at_ms,
                ready: resp.ready,
            }),
            Ok(Ok(resp)) => {
                tracing::warn!(
                    expected = peer,
                    actual = resp.node_id,
                    %addr,
                    "peer answered with an unexpected node id"
                );
                None
            }
            Ok(Err(e)) => {
                tracing::trace!(peer, %addr, error = %e, "probe failed");
                None
            }
            Err(_) => {
                tracing::trace!(peer, %addr, "probe timed out");
                None
            }
        }
    }

    /// Replace the view if anything changed. The view id only moves when the
    /// member set does; readiness flips update the view in place.
    fn publish(&self, members: Vec<Member>) -> ViewChange {
        self.update(|_| members)
    }

    fn update(&self, members: impl FnOnce(&View) -> Vec<Member>) -> ViewChange {
        let mut change = ViewChange::default();

        self.views.send_if_modified(|view| {
            let next = View::new(view.id, members(view));
            if next.members == view.members {
                return false;
            }

            change.joined = next
                .member_ids()
                .into_iter()
                .filter(|id| !view.contains(*id))
                .collect();
            change.left = view
                .member_ids()
                .into_iter()
                .filter(|id| !next.contains(*id))
                .collect();

            let id = if next.same_members(view) {
                view.id
            } else {
                view.id + 1
            };
            *view = View { id, ..next };
            true
        });

        change
    }
}
