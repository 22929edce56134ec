//! The replicated quote store.

use crate::command::{ReplicaCommand, ReplicaResponse};
use parking_lot::Mutex;
use std::collections::HashMap;

use super::snapshot::StockSnapshot;

/// The local copy of the replicated quote map.
///
/// All access goes through a single mutex which every operation holds for
/// its full duration. The guard is never held across an `.await`, so it
/// cannot be held across a network call.
#[derive(Debug, Default)]
pub struct ReplicatedStore {
    stocks: Mutex<HashMap<String, f64>>,
}

impl ReplicatedStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a quote.
    pub fn apply_set(&self, symbol: &str, price: f64) {
        let mut stocks = self.stocks.lock();
        stocks.insert(symbol.to_string(), price);
        tracing::info!(symbol, price, "-- set quote");
    }

    /// Remove a quote. Removing an absent symbol is a no-op.
    pub fn apply_remove(&self, symbol: &str) {
        let mut stocks = self.stocks.lock();
        let removed = stocks.remove(symbol);
        tracing::info!(symbol, present = removed.is_some(), "-- removed quote");
    }

    /// Current price of a symbol.
    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.stocks.lock().get(symbol).copied()
    }

    /// Conditionally set a quote.
    ///
    /// Succeeds when there is no entry and `reference` is `None`, or when the
    /// entry's price equals `reference`. The check and the write happen under
    /// one acquisition of the guard.
    pub fn apply_cas(&self, symbol: &str, reference: Option<f64>, new_value: f64) -> bool {
        let mut stocks = self.stocks.lock();

        let matches = match (stocks.get(symbol), reference) {
            (None, None) => true,
            (Some(current), Some(expected)) => *current == expected,
            _ => false,
        };

        if matches {
            stocks.insert(symbol.to_string(), new_value);
            tracing::info!(symbol, new_value, "-- cas -- set");
        } else {
            tracing::info!(symbol, new_value, "-- cas -- failed");
        }
        matches
    }

    /// Apply a replicated command.
    pub fn apply(&self, cmd: &ReplicaCommand) -> ReplicaResponse {
        match cmd {
            ReplicaCommand::ApplySet { symbol, price } => {
                self.apply_set(symbol, *price);
                ReplicaResponse::Applied
            }
            ReplicaCommand::ApplyRemove { symbol } => {
                self.apply_remove(symbol);
                ReplicaResponse::Applied
            }
            ReplicaCommand::ApplyCas {
                symbol,
                reference,
                new_value,
            } => ReplicaResponse::Vote(self.apply_cas(symbol, *reference, *new_value)),
        }
    }

    /// Copy of the whole map at a single instant.
    pub fn snapshot(&self) -> StockSnapshot {
        let stocks = self.stocks.lock();
        StockSnapshot::from_iter(stocks.iter().map(|(k, v)| (k.clone(), *v)))
    }

    /// Replace the whole map with a snapshot.
    pub fn restore(&self, snapshot: StockSnapshot) {
        let mut stocks = self.stocks.lock();
        stocks.clear();
        stocks.extend(snapshot.into_entries());
    }

    /// All quotes sorted by symbol.
    pub fn entries(&self) -> Vec<(String, f64)> {
        self.snapshot().into_entries().collect()
    }

    /// Number of quotes held.
    pub fn len(&self) -> usize {
        self.stocks.lock().len()
    }

    /// Whether the store holds no quotes.
    pub fn is_empty(&self) -> bool {
        self.stocks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_get_remove() {
        let store = ReplicatedStore::new();
        assert_eq!(store.get("AAPL"), None);

        store.apply_set("AAPL", 100.0);
        store.apply_set("AAPL", 101.0);
        assert_eq!(store.get("AAPL"), Some(101.0));

        store.apply_remove("AAPL");
        assert_eq!(store.get("AAPL"), None);

        // Removing an absent symbol is a no-op.
        store.apply_remove("AAPL");
        assert!(store.is_empty());
    }

    #[test]
    fn test_cas_on_absent_entry() {
        let store = ReplicatedStore::new();

        assert!(!store.apply_cas("AAPL", Some(1.0), 2.0));
        assert_eq!(store.get("AAPL"), None);

        assert!(store.apply_cas("AAPL", None, 2.0));
        assert_eq!(store.get("AAPL"), Some(2.0));
    }

    #[test]
    fn test_cas_on_present_entry() {
        let store = ReplicatedStore::new();
        store.apply_set("AAPL", 100.0);

        assert!(!store.apply_cas("AAPL", None, 5.0));
        assert!(!store.apply_cas("AAPL", Some(999.0), 5.0));
        assert_eq!(store.get("AAPL"), Some(100.0));

        assert!(store.apply_cas("AAPL", Some(100.0), 101.0));
        assert_eq!(store.get("AAPL"), Some(101.0));
    }

    #[test]
    fn test_apply_dispatches_commands() {
        let store = ReplicatedStore::new();

        let resp = store.apply(&ReplicaCommand::ApplySet {
            symbol: "MSFT".to_string(),
            price: 200.0,
        });
        assert_eq!(resp, ReplicaResponse::Applied);

        let resp = store.apply(&ReplicaCommand::ApplyCas {
            symbol: "MSFT".to_string(),
            reference: Some(200.0),
            new_value: 201.0,
        });
        assert_eq!(resp, ReplicaResponse::Vote(true));

        let resp = store.apply(&ReplicaCommand::ApplyRemove {
            symbol: "MSFT".to_string(),
        });
        assert_eq!(resp, ReplicaResponse::Applied);
        assert!(store.is_empty());
    }

    #[test]
    fn test_snapshot_restore() {
        let donor = ReplicatedStore::new();
        donor.apply_set("AAPL", 100.0);
        donor.apply_set("MSFT", 200.0);

        let joiner = ReplicatedStore::new();
        joiner.apply_set("STALE", 1.0);
        joiner.restore(donor.snapshot());

        assert_eq!(
            joiner.entries(),
            vec![("AAPL".to_string(), 100.0), ("MSFT".to_string(), 200.0)]
        );

        // Restoring twice is harmless.
        joiner.restore(donor.snapshot());
        assert_eq!(joiner.len(), 2);
    }

    #[test]
    fn test_concurrent_cas_single_winner() {
        let store = Arc::new(ReplicatedStore::new());
        store.apply_set("AAPL", 100.0);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.apply_cas("AAPL", Some(100.0), 200.0 + i as f64))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
