//! Replicated state: the local copy of the quote map.
//!
//! Every member owns one [`ReplicatedStore`]. Remote commands reach it
//! through the [`ReplicaEndpoint`], which the transport invokes; snapshots
//! produced here seed joining members.

mod endpoint;
mod snapshot;
mod store;

pub use endpoint::ReplicaEndpoint;
pub use snapshot::StockSnapshot;
pub use store::ReplicatedStore;
