//! Cluster-wide compare-and-swap.
//!
//! A CAS on a symbol runs through these phases:
//!
//! ```text
//! Idle -> LockAcquiring -> Broadcasting -> Tallying -> Done(success | failure)
//!              |                |              |
//!              +----------------+--------------+--> Done (error, lock released)
//! ```
//!
//! The lock is named after the symbol, so CAS calls on different symbols
//! never contend. Plain set/remove broadcasts do not take it and can race
//! with an in-flight CAS on the same symbol.

use crate::command::{
    ReplicaCommand, ReplicaResponse, parse_price, parse_reference, parse_symbol,
};
use crate::error::{ClusterError, ClusterResult};
use crate::transport::GroupTransport;
use crate::types::{QuorumPolicy, Responses};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Phase of a single CAS invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasPhase {
    /// Not started.
    Idle,
    /// Waiting for the per-symbol distributed lock.
    LockAcquiring,
    /// Lock held; conditional apply sent to every member.
    Broadcasting,
    /// Counting votes.
    Tallying,
    /// Finished; `true` when the majority voted yes.
    Done(bool),
}

impl CasPhase {
    /// Whether `next` may follow this phase.
    ///
    /// Any in-flight phase may jump straight to `Done` when an error aborts
    /// the call.
    pub fn can_advance_to(self, next: CasPhase) -> bool {
        use CasPhase::*;
        matches!(
            (self, next),
            (Idle, LockAcquiring)
                | (LockAcquiring, Broadcasting)
                | (Broadcasting, Tallying)
                | (Tallying, Done(_))
                | (LockAcquiring, Done(false))
                | (Broadcasting, Done(false))
        )
    }

    fn advance(&mut self, next: CasPhase, symbol: &str) {
        debug_assert!(self.can_advance_to(next), "{:?} -> {:?}", self, next);
        tracing::trace!(symbol, from = ?*self, to = ?next, "cas phase");
        *self = next;
    }
}

/// Vote counts for one CAS broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuorumTally {
    /// Members the call was sent to.
    pub members: usize,
    /// Members that actually answered.
    pub received: usize,
    /// Members that voted yes.
    pub true_count: usize,
}

impl QuorumTally {
    /// Count the votes in a set of responses.
    pub fn from_responses(responses: &Responses<ReplicaResponse>) -> Self {
        let true_count = responses
            .iter()
            .filter(|r| r.reply.value().and_then(ReplicaResponse::vote) == Some(true))
            .count();

        Self {
            members: responses.len(),
            received: responses.num_received(),
            true_count,
        }
    }

    /// Whether the yes votes form a strict majority under `policy`.
    pub fn succeeded(&self, policy: QuorumPolicy) -> bool {
        let base = match policy {
            QuorumPolicy::ReceivedResponses => self.received,
            QuorumPolicy::KnownMembers => self.members,
        };
        self.true_count > base / 2
    }
}

/// Result of a completed CAS.
#[derive(Debug, Clone)]
pub struct CasOutcome {
    /// Target symbol.
    pub symbol: String,
    /// Value the call tried to install.
    pub new_value: f64,
    /// Whether the majority voted yes.
    pub succeeded: bool,
    /// Vote counts.
    pub tally: QuorumTally,
    /// Per-member replies.
    pub responses: Responses<ReplicaResponse>,
}

impl fmt::Display for CasOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Compare and Swap: {} set to {} {} ({}/{} votes, {} members)",
            self.symbol,
            self.new_value,
            if self.succeeded { "succeeded" } else { "failed" },
            self.tally.true_count,
            self.tally.received,
            self.tally.members,
        )
    }
}

/// A held distributed lock.
///
/// Call [`release`](Self::release) on the normal path. If the guard is
/// dropped while still held (early return, panic, cancelled future), the
/// release is sent from a spawned task.
struct DistributedLockGuard {
    transport: Arc<dyn GroupTransport>,
    name: String,
    released: bool,
}

impl DistributedLockGuard {
    async fn release(mut self) -> ClusterResult<()> {
        self.released = true;
        self.transport.release_lock(&self.name).await
    }
}

impl Drop for DistributedLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.release_lock(&name).await {
                        tracing::warn!(lock = %name, error = %e, "failed to release abandoned lock");
                    }
                });
            }
            Err(_) => {
                tracing::error!(lock = %name, "lock dropped outside a runtime, not released");
            }
        }
    }
}

/// Runs compare-and-swap across the cluster.
#[derive(Clone)]
pub struct CasCoordinator {
    transport: Arc<dyn GroupTransport>,
    policy: QuorumPolicy,
    lock_timeout: Option<Duration>,
}

impl CasCoordinator {
    /// Create a coordinator with the default policy and no lock timeout.
    pub fn new(transport: Arc<dyn GroupTransport>) -> Self {
        Self {
            transport,
            policy: QuorumPolicy::default(),
            lock_timeout: None,
        }
    }

    /// Use a different quorum policy.
    pub fn with_policy(mut self, policy: QuorumPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound lock acquisition; `None` waits forever.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Name of the distributed lock guarding `symbol`.
    pub fn lock_name(symbol: &str) -> String {
        format!("lock {}", symbol)
    }

    /// Parse client input and run the CAS.
    ///
    /// An empty `reference` means "no current value". Malformed input is
    /// rejected before any lock is taken or RPC sent.
    pub async fn compare_and_swap(
        &self,
        symbol: &str,
        reference: &str,
        new_value: &str,
    ) -> ClusterResult<CasOutcome> {
        let symbol = parse_symbol(symbol)?;
        let reference = parse_reference(reference)?;
        let new_value = parse_price(new_value)?;
        self.execute(&symbol, reference, new_value).await
    }

    /// Run the CAS with already-parsed values.
    pub async fn execute(
        &self,
        symbol: &str,
        reference: Option<f64>,
        new_value: f64,
    ) -> ClusterResult<CasOutcome> {
        if !new_value.is_finite() || reference.is_some_and(|r| !r.is_finite()) {
            return Err(ClusterError::InvalidInput(
                "prices must be finite numbers".to_string(),
            ));
        }

        let mut phase = CasPhase::Idle;
        phase.advance(CasPhase::LockAcquiring, symbol);

        let guard = match self.acquire(symbol).await {
            Ok(guard) => guard,
            Err(e) => {
                phase.advance(CasPhase::Done(false), symbol);
                return Err(e);
            }
        };

        let result = self.vote(&mut phase, symbol, reference, new_value).await;

        if let Err(e) = guard.release().await {
            tracing::warn!(symbol, error = %e, "failed to release cas lock");
        }

        if let Ok(outcome) = &result {
            tracing::info!(
                symbol,
                new_value,
                succeeded = outcome.succeeded,
                true_count = outcome.tally.true_count,
                received = outcome.tally.received,
                "compare and swap finished"
            );
        }
        result
    }

    async fn acquire(&self, symbol: &str) -> ClusterResult<DistributedLockGuard> {
        let name = Self::lock_name(symbol);
        let acquire = self.transport.acquire_lock(&name);

        match self.lock_timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| ClusterError::LockTimeout { name: name.clone() })??,
            None => acquire.await?,
        }

        Ok(DistributedLockGuard {
            transport: Arc::clone(&self.transport),
            name,
            released: false,
        })
    }

    async fn vote(
        &self,
        phase: &mut CasPhase,
        symbol: &str,
        reference: Option<f64>,
        new_value: f64,
    ) -> ClusterResult<CasOutcome> {
        phase.advance(CasPhase::Broadcasting, symbol);

        let responses = match self
            .transport
            .broadcast(ReplicaCommand::ApplyCas {
                symbol: symbol.to_string(),
                reference,
                new_value,
            })
            .await
        {
            Ok(responses) => responses,
            Err(e) => {
                phase.advance(CasPhase::Done(false), symbol);
                return Err(e);
            }
        };

        phase.advance(CasPhase::Tallying, symbol);
        let tally = QuorumTally::from_responses(&responses);
        let succeeded = tally.succeeded(self.policy);
        phase.advance(CasPhase::Done(succeeded), symbol);

        Ok(CasOutcome {
            symbol: symbol.to_string(),
            new_value,
            succeeded,
            tally,
            responses,
        })
    }
}
