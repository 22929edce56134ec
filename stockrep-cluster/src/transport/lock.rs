//! Central lock table.
//!
//! Hosted by the view coordinator. Each lock name maps to its own async
//! mutex, so holders of different names never wait on each other.
//!
//! Every request carries a [`LockOwner`]: the requesting member plus a
//! ticket unique among that member's requests. A member can then revoke
//! one request it gave up on without touching a lock that another of its
//! requests legitimately holds.

use crate::types::NodeId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// One lock request: who asked, and which of their requests it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner {
    /// Requesting member.
    pub node_id: NodeId,
    /// Distinguishes concurrent requests from the same member.
    pub ticket: u64,
}

impl LockOwner {
    /// Identify a request.
    pub fn new(node_id: NodeId, ticket: u64) -> Self {
        Self { node_id, ticket }
    }
}

struct HeldLock {
    owner: LockOwner,
    _guard: OwnedMutexGuard<()>,
}

#[derive(Default)]
struct Grants {
    held: HashMap<String, HeldLock>,
    /// Requests revoked before they were granted.
    revoked: HashSet<(String, LockOwner)>,
}

/// Named locks granted to cluster members.
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    grants: Mutex<Grants>,
}

impl LockTable {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `name` is free, then grant it to `owner`.
    ///
    /// Returns `false` without granting when the request was revoked while
    /// it waited. Dropping the returned future before it completes leaves
    /// the lock untouched.
    pub async fn lock(&self, name: &str, owner: LockOwner) -> bool {
        let mutex = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(name.to_string()).or_default())
        };

        let guard = mutex.lock_owned().await;

        let mut grants = self.grants.lock();
        if grants.revoked.remove(&(name.to_string(), owner)) {
            tracing::debug!(
                lock = name,
                owner = owner.node_id,
                ticket = owner.ticket,
                "revoked request not granted"
            );
            return false;
        }
        grants.held.insert(
            name.to_string(),
            HeldLock {
                owner,
                _guard: guard,
            },
        );
        tracing::debug!(
            lock = name,
            owner = owner.node_id,
            ticket = owner.ticket,
            "lock granted"
        );
        true
    }

    /// Release `name` if it is held by `owner`. Returns whether it was.
    pub fn unlock(&self, name: &str, owner: LockOwner) -> bool {
        let mut grants = self.grants.lock();
        Self::release(&mut grants, name, owner)
    }

    /// Withdraw a request the caller stopped waiting for.
    ///
    /// Releases the lock if the request was already granted and returns
    /// `true`; otherwise the request will not be granted when its turn
    /// comes.
    pub fn revoke(&self, name: &str, owner: LockOwner) -> bool {
        let mut grants = self.grants.lock();
        if Self::release(&mut grants, name, owner) {
            return true;
        }
        grants.revoked.insert((name.to_string(), owner));
        false
    }

    fn release(grants: &mut Grants, name: &str, owner: LockOwner) -> bool {
        match grants.held.get(name) {
            Some(lock) if lock.owner == owner => {
                grants.held.remove(name);
                tracing::debug!(
                    lock = name,
                    owner = owner.node_id,
                    ticket = owner.ticket,
                    "lock released"
                );
                true
            }
            _ => false,
        }
    }

    /// Release every lock held by `node_id` and forget its revoked
    /// requests, returning the names of the released locks.
    ///
    /// Called by the coordinator when `node_id` leaves the view.
    pub fn release_owner(&self, node_id: NodeId) -> Vec<String> {
        let mut grants = self.grants.lock();
        let names: Vec<String> = grants
            .held
            .iter()
            .filter(|(_, lock)| lock.owner.node_id == node_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            grants.held.remove(name);
        }
        grants.revoked.retain(|(_, owner)| owner.node_id != node_id);

        if !names.is_empty() {
            tracing::info!(owner = node_id, locks = ?names, "released locks of departed member");
        }
        names
    }

    /// The member currently holding `name`.
    pub fn holder(&self, name: &str) -> Option<NodeId> {
        self.grants
            .lock()
            .held
            .get(name)
            .map(|lock| lock.owner.node_id)
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held: Vec<_> = self
            .grants
            .lock()
            .held
            .iter()
            .map(|(name, lock)| (name.clone(), lock.owner))
            .collect();
        f.debug_struct("LockTable").field("held", &held).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn owner(node_id: NodeId) -> LockOwner {
        LockOwner::new(node_id, 0)
    }

    #[tokio::test]
    async fn test_lock_unlock() {
        let table = LockTable::new();
        assert!(table.lock("lock AAPL", owner(1)).await);
        assert_eq!(table.holder("lock AAPL"), Some(1));

        // Only the owner can release.
        assert!(!table.unlock("lock AAPL", owner(2)));
        assert!(!table.unlock("lock AAPL", LockOwner::new(1, 7)));
        assert!(table.unlock("lock AAPL", owner(1)));
        assert_eq!(table.holder("lock AAPL"), None);
        assert!(!table.unlock("lock AAPL", owner(1)));
    }

    #[tokio::test]
    async fn test_distinct_names_do_not_contend() {
        let table = LockTable::new();
        table.lock("lock AAPL", owner(1)).await;

        tokio::time::timeout(Duration::from_millis(200), table.lock("lock MSFT", owner(2)))
            .await
            .expect("different names must not block each other");
        assert_eq!(table.holder("lock MSFT"), Some(2));
    }

    #[tokio::test]
    async fn test_waiter_granted_after_release() {
        let table = Arc::new(LockTable::new());
        table.lock("lock AAPL", owner(1)).await;

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.lock("lock AAPL", owner(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(table.holder("lock AAPL"), Some(1));

        assert!(table.unlock("lock AAPL", owner(1)));
        let granted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be granted")
            .unwrap();
        assert!(granted);
        assert_eq!(table.holder("lock AAPL"), Some(2));
    }

    #[tokio::test]
    async fn test_release_owner_frees_only_its_locks() {
        let table = LockTable::new();
        table.lock("lock AAPL", owner(1)).await;
        table.lock("lock MSFT", LockOwner::new(1, 1)).await;
        table.lock("lock IBM", owner(2)).await;

        let mut released = table.release_owner(1);
        released.sort();
        assert_eq!(released, vec!["lock AAPL", "lock MSFT"]);
        assert_eq!(table.holder("lock AAPL"), None);
        assert_eq!(table.holder("lock IBM"), Some(2));

        tokio::time::timeout(Duration::from_millis(200), table.lock("lock AAPL", owner(3)))
            .await
            .expect("released lock should be free");
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_lock_free() {
        let table = LockTable::new();
        table.lock("lock AAPL", owner(1)).await;

        let attempt =
            tokio::time::timeout(Duration::from_millis(50), table.lock("lock AAPL", owner(2))).await;
        assert!(attempt.is_err());

        assert!(table.unlock("lock AAPL", owner(1)));
        table.lock("lock AAPL", owner(3)).await;
        assert_eq!(table.holder("lock AAPL"), Some(3));
    }

    #[tokio::test]
    async fn test_revoke_after_grant_releases() {
        let table = LockTable::new();
        let abandoned = LockOwner::new(2, 5);
        table.lock("lock AAPL", abandoned).await;

        assert!(table.revoke("lock AAPL", abandoned));
        assert_eq!(table.holder("lock AAPL"), None);
    }

    #[tokio::test]
    async fn test_revoked_waiter_is_never_granted() {
        let table = Arc::new(LockTable::new());
        table.lock("lock AAPL", owner(1)).await;

        let abandoned = LockOwner::new(2, 5);
        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.lock("lock AAPL", abandoned).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!table.revoke("lock AAPL", abandoned));
        assert!(table.unlock("lock AAPL", owner(1)));

        let granted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert!(!granted);
        assert_eq!(table.holder("lock AAPL"), None);

        tokio::time::timeout(Duration::from_millis(200), table.lock("lock AAPL", owner(3)))
            .await
            .expect("lock should be free again");
    }

    #[tokio::test]
    async fn test_revoke_spares_other_requests_of_same_member() {
        let table = LockTable::new();
        let holding = LockOwner::new(2, 1);
        table.lock("lock AAPL", holding).await;

        assert!(!table.revoke("lock AAPL", LockOwner::new(2, 2)));
        assert_eq!(table.holder("lock AAPL"), Some(2));
        assert!(table.unlock("lock AAPL", holding));
    }
}
