//! Shared types for membership views and broadcast responses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node ID type for the cluster.
///
/// Each node in the cluster has a unique 64-bit identifier.
pub type NodeId = u64;

/// A member of the current view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member's node ID.
    pub node_id: NodeId,
    /// Member's RPC address (empty for in-memory members).
    pub addr: String,
    /// When the member process started, used to order the view.
    pub started_at_ms: u64,
    /// Whether the member has completed state transfer.
    pub ready: bool,
}

/// An ordered snapshot of the currently reachable members.
///
/// Members are ordered by age: the first member is the longest-lived one
/// and acts as coordinator (state donor and lock table host).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Monotonic view number, bumped on every membership change.
    pub id: u64,
    /// Members in age order.
    pub members: Vec<Member>,
}

impl View {
    /// Build a view, ordering members by `(started_at_ms, node_id)`.
    pub fn new(id: u64, mut members: Vec<Member>) -> Self {
        members.sort_by_key(|m| (m.started_at_ms, m.node_id));
        Self { id, members }
    }

    /// The coordinator (oldest member), if any.
    pub fn coordinator(&self) -> Option<&Member> {
        self.members.first()
    }

    /// Number of members in the view.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether the node is a member of this view.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.members.iter().any(|m| m.node_id == node_id)
    }

    /// Member IDs in view order.
    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.node_id).collect()
    }

    /// The member a joining node should fetch its state from: the oldest
    /// ready member other than `joiner`.
    pub fn state_donor(&self, joiner: NodeId) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.node_id != joiner && m.ready)
    }

    /// Whether two views have the same members in the same order.
    pub fn same_members(&self, other: &View) -> bool {
        self.member_ids() == other.member_ids()
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let coordinator = self.coordinator().map(|m| m.node_id).unwrap_or_default();
        write!(f, "[{}|{}] (", coordinator, self.id)?;
        for (i, id) in self.member_ids().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, ")")
    }
}

/// One member's outcome for a broadcast call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    /// The member answered with a value.
    Value(T),
    /// The member answered, but with an error.
    Error(String),
    /// The member was unreachable, suspected, or not ready.
    Unavailable(String),
    /// The member did not answer within the RPC timeout.
    TimedOut,
}

impl<T> Reply<T> {
    /// Whether a response was actually received from the member.
    ///
    /// Error replies count as received; silence does not.
    pub fn was_received(&self) -> bool {
        matches!(self, Reply::Value(_) | Reply::Error(_))
    }

    /// The value, if the member answered with one.
    pub fn value(&self) -> Option<&T> {
        match self {
            Reply::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl<T: fmt::Debug> fmt::Display for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value(v) => write!(f, "received={:?}", v),
            Reply::Error(e) => write!(f, "error={}", e),
            Reply::Unavailable(reason) => write!(f, "unavailable ({})", reason),
            Reply::TimedOut => write!(f, "timed out"),
        }
    }
}

/// A member's reply paired with its ID.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberReply<T> {
    /// Responding member.
    pub member: NodeId,
    /// What came back.
    pub reply: Reply<T>,
}

/// Per-member responses collected by a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Responses<T> {
    replies: Vec<MemberReply<T>>,
}

impl<T> Default for Responses<T> {
    fn default() -> Self {
        Self {
            replies: Vec::new(),
        }
    }
}

impl<T> Responses<T> {
    /// Create from a list of member replies.
    pub fn new(mut replies: Vec<MemberReply<T>>) -> Self {
        replies.sort_by_key(|r| r.member);
        Self { replies }
    }

    /// Number of members the call was sent to.
    pub fn len(&self) -> usize {
        self.replies.len()
    }

    /// Whether the call had no targets.
    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    /// Number of members that actually answered.
    pub fn num_received(&self) -> usize {
        self.replies.iter().filter(|r| r.reply.was_received()).count()
    }

    /// Iterate over member replies.
    pub fn iter(&self) -> impl Iterator<Item = &MemberReply<T>> {
        self.replies.iter()
    }

    /// The reply from a given member.
    pub fn get(&self, member: NodeId) -> Option<&Reply<T>> {
        self.replies
            .iter()
            .find(|r| r.member == member)
            .map(|r| &r.reply)
    }
}

impl<T: fmt::Debug> fmt::Display for Responses<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.replies {
            writeln!(f, "node-{}: {}", r.member, r.reply)?;
        }
        Ok(())
    }
}

/// How the CAS tally sizes its majority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Strict majority of the responses actually received.
    ///
    /// Under a partition a CAS can succeed against a minority of the full
    /// cluster: a call that hears back from a single member succeeds if that
    /// member voted yes.
    #[default]
    ReceivedResponses,
    /// Strict majority of the members in the view the call was sent to.
    KnownMembers,
}
