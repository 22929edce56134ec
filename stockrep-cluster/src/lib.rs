//! Replicated stock quote map.
//!
//! Every member of a group holds a full copy of a `symbol -> price` map.
//! Updates are broadcast to all members and applied locally on each;
//! joining members copy the state of the longest-lived member; and a
//! compare-and-swap is made safe cluster-wide by a per-symbol distributed
//! lock plus a majority vote.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Replica Group                          │
//! │                                                               │
//! │  ┌─────────────┐     ┌─────────────┐     ┌─────────────┐      │
//! │  │   Node 1    │     │   Node 2    │     │   Node 3    │      │
//! │  │ (coordinator│     │             │     │             │      │
//! │  │  lock table)│     │             │     │             │      │
//! │  │ ┌─────────┐ │     │ ┌─────────┐ │     │ ┌─────────┐ │      │
//! │  │ │Broadcast│◄┼─────┼─┤Broadcast│◄┼─────┼─┤Broadcast│ │      │
//! │  │ │   CAS   │─┼─────┼►│   CAS   │─┼─────┼►│   CAS   │ │      │
//! │  │ └────┬────┘ │     │ └────┬────┘ │     │ └────┬────┘ │      │
//! │  │ ┌────▼────┐ │     │ ┌────▼────┐ │     │ ┌────▼────┐ │      │
//! │  │ │  Store  │ │     │ │  Store  │ │     │ │  Store  │ │      │
//! │  │ └─────────┘ │     │ └─────────┘ │     │ └─────────┘ │      │
//! │  └─────────────┘     └─────────────┘     └─────────────┘      │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no log and no leader: replicas converge only while every
//! update reaches every member. Concurrent plain writes to one symbol may
//! be applied in different orders on different members.
//!
//! # Usage
//!
//! ```ignore
//! use stockrep_cluster::{ClusterConfig, ReplicaNode};
//!
//! let config = ClusterConfig::builder()
//!     .node_id(1)
//!     .listen_addr("127.0.0.1:7800")
//!     .peer(2, "127.0.0.1:7801")
//!     .build()?;
//!
//! let node = ReplicaNode::start(config).await?;
//! node.set("AAPL", 100.0).await?;
//! let outcome = node.compare_and_swap("AAPL", "100", "101").await?;
//! println!("{}", outcome);
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod observability;
pub mod replication;
pub mod state;
pub mod transport;
pub mod types;

// Include generated protobuf code
pub mod proto {
    tonic::include_proto!("stockrep.replica");
}

pub use command::{ReplicaCommand, ReplicaResponse};
pub use config::{ClusterConfig, ClusterConfigBuilder, MembershipConfig, RpcConfig};
pub use error::{ClusterError, ClusterResult};
pub use network::GrpcTransport;
pub use node::{NodeOptions, ReplicaNode};
pub use replication::{
    CasCoordinator, CasOutcome, StateTransfer, TransferOutcome, UpdateBroadcaster,
};
pub use state::{ReplicaEndpoint, ReplicatedStore, StockSnapshot};
pub use transport::{GroupTransport, InMemoryNetwork, InMemoryTransport, ReplicaHandler};
pub use types::{Member, NodeId, QuorumPolicy, Reply, Responses, View};
