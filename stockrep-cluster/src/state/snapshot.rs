//! Snapshot data exchanged during state transfer.

use crate::error::ClusterResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full copy of a member's quote map.
///
/// Ordered by symbol so the serialized form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockSnapshot {
    stocks: BTreeMap<String, f64>,
}

impl StockSnapshot {
    /// Encode for the wire.
    pub fn encode(&self) -> ClusterResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a snapshot received from a donor.
    pub fn decode(bytes: &[u8]) -> ClusterResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Number of quotes.
    pub fn len(&self) -> usize {
        self.stocks.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.stocks.is_empty()
    }

    /// Price of a symbol in this snapshot.
    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.stocks.get(symbol).copied()
    }

    /// Consume into `(symbol, price)` pairs sorted by symbol.
    pub fn into_entries(self) -> impl Iterator<Item = (String, f64)> {
        self.stocks.into_iter()
    }
}

impl FromIterator<(String, f64)> for StockSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self {
            stocks: iter.into_iter().collect(),
        }
    }
}
