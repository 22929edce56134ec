//! Replica commands - the RPCs broadcast to every member.
//!
//! Each command is serialized, fanned out by the transport, and applied to
//! every member's local store. There is no log and no sequencer: members
//! apply commands in whatever order they arrive.

use crate::error::{ClusterError, ClusterResult};
use serde::{Deserialize, Serialize};

/// Commands invoked on every member by a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicaCommand {
    /// Insert or overwrite a quote.
    ApplySet {
        /// Stock symbol.
        symbol: String,
        /// New price.
        price: f64,
    },

    /// Remove a quote if present.
    ApplyRemove {
        /// Stock symbol.
        symbol: String,
    },

    /// Conditionally set a quote; each member votes with the outcome.
    ApplyCas {
        /// Stock symbol.
        symbol: String,
        /// Expected current price, `None` meaning "no entry".
        reference: Option<f64>,
        /// Price to install when the expectation holds.
        new_value: f64,
    },
}

impl ReplicaCommand {
    /// Get a human-readable name for this command type.
    pub fn name(&self) -> &'static str {
        match self {
            ReplicaCommand::ApplySet { .. } => "ApplySet",
            ReplicaCommand::ApplyRemove { .. } => "ApplyRemove",
            ReplicaCommand::ApplyCas { .. } => "ApplyCas",
        }
    }

    /// The symbol this command targets.
    pub fn symbol(&self) -> &str {
        match self {
            ReplicaCommand::ApplySet { symbol, .. }
            | ReplicaCommand::ApplyRemove { symbol }
            | ReplicaCommand::ApplyCas { symbol, .. } => symbol,
        }
    }
}

/// What a member sends back after applying a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaResponse {
    /// An unconditional command was applied.
    Applied,
    /// Outcome of a conditional apply.
    Vote(bool),
}

impl ReplicaResponse {
    /// The vote carried by this response, if any.
    pub fn vote(&self) -> Option<bool> {
        match self {
            ReplicaResponse::Vote(v) => Some(*v),
            ReplicaResponse::Applied => None,
        }
    }
}

/// Parse a price typed by a client.
///
/// Non-finite values are rejected: they cannot be carried in the JSON wire
/// format and can never match in a compare-and-swap.
pub fn parse_price(input: &str) -> ClusterResult<f64> {
    let trimmed = input.trim();
    let price: f64 = trimmed
        .parse()
        .map_err(|_| ClusterError::InvalidInput(format!("'{}' is not a number", trimmed)))?;

    if !price.is_finite() {
        return Err(ClusterError::InvalidInput(format!(
            "'{}' is not a finite price",
            trimmed
        )));
    }
    Ok(price)
}

/// Parse a CAS reference value; an empty string means "no current value".
pub fn parse_reference(input: &str) -> ClusterResult<Option<f64>> {
    if input.trim().is_empty() {
        return Ok(None);
    }
    parse_price(input).map(Some)
}

/// Validate a stock symbol typed by a client.
pub fn parse_symbol(input: &str) -> ClusterResult<String> {
    let symbol = input.trim();
    if symbol.is_empty() {
        return Err(ClusterError::InvalidInput("symbol is empty".to_string()));
    }
    Ok(symbol.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("100.0").unwrap(), 100.0);
        assert_eq!(parse_price(" 42 ").unwrap(), 42.0);
        assert!(parse_price("abc").unwrap_err().is_input_error());
        assert!(parse_price("").unwrap_err().is_input_error());
        assert!(parse_price("NaN").unwrap_err().is_input_error());
        assert!(parse_price("inf").unwrap_err().is_input_error());
    }

    #[test]
    fn test_parse_reference_empty_means_absent() {
        assert_eq!(parse_reference("").unwrap(), None);
        assert_eq!(parse_reference("   ").unwrap(), None);
        assert_eq!(parse_reference("99.5").unwrap(), Some(99.5));
        assert!(parse_reference("x").is_err());
    }

    #[test]
    fn test_parse_symbol() {
        assert_eq!(parse_symbol(" AAPL ").unwrap(), "AAPL");
        assert!(parse_symbol("  ").is_err());
    }

    #[test]
    fn test_command_wire_format() {
        let cmd = ReplicaCommand::ApplyCas {
            symbol: "AAPL".to_string(),
            reference: None,
            new_value: 5.0,
        };
        let bytes = serde_json::to_vec(&cmd).unwrap();
        let decoded: ReplicaCommand = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(decoded.name(), "ApplyCas");
        assert_eq!(decoded.symbol(), "AAPL");
    }
}
