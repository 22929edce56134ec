//! Replication protocols driven from the local member.
//!
//! - `broadcaster`: unconditional set/remove fanned out to every member
//! - `transfer`: join-time state transfer from the coordinator
//! - `cas`: lock, broadcast a conditional set, tally a majority vote

mod broadcaster;
mod cas;
mod transfer;

pub use broadcaster::UpdateBroadcaster;
pub use cas::{CasCoordinator, CasOutcome, CasPhase, QuorumTally};
pub use transfer::{StateTransfer, TransferOutcome};
