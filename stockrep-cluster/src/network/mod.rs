//! gRPC group transport.
//!
//! Replica commands, state transfer and liveness probes travel over the
//! `ReplicaService`; distributed locks over the `LockService` hosted by the
//! view coordinator. Payloads are serde_json bytes carried in protobuf
//! fields.

mod client;
mod membership;
mod server;
mod transport;

pub use client::PeerClients;
pub use membership::{Membership, ViewChange};
pub use server::{LockServer, ReplicaServer};
pub use transport::GrpcTransport;
