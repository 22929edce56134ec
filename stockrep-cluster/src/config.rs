//! Replica node configuration.

use crate::error::{ClusterError, ClusterResult};
use crate::types::{NodeId, QuorumPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Configuration for a replica node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// This node's unique ID in the cluster (1-based).
    pub node_id: NodeId,

    /// Name of the replica group, used in logs.
    pub cluster_name: String,

    /// Address this node listens on for replica RPC (e.g., "0.0.0.0:7800").
    pub listen_addr: String,

    /// Address advertised to other nodes (e.g., "192.168.1.10:7800").
    /// If not set, the address the listener actually bound is advertised.
    pub advertise_addr: Option<String>,

    /// Nodes in the cluster: node_id -> address. An entry for this node
    /// itself is allowed and ignored, so one file can serve every node.
    /// Keys are written as strings since TOML table keys cannot be integers.
    #[serde(serialize_with = "serialize_peers", deserialize_with = "deserialize_peers")]
    pub peers: HashMap<NodeId, String>,

    /// RPC timing configuration.
    pub rpc: RpcConfig,

    /// Failure detection configuration.
    pub membership: MembershipConfig,

    /// How long a joining node waits for its state, in milliseconds.
    pub state_transfer_timeout_ms: u64,

    /// Bound on distributed lock acquisition. `None` waits forever.
    pub lock_timeout_ms: Option<u64>,

    /// How compare-and-swap sizes its majority.
    pub quorum: QuorumPolicy,
}

/// RPC timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Per-member wait for a broadcast reply, in milliseconds.
    pub timeout_ms: u64,

    /// TCP connect timeout, in milliseconds.
    pub connect_timeout_ms: u64,
}

/// Failure detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Interval between liveness probes of every peer, in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Timeout for a single probe, in milliseconds.
    pub probe_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            cluster_name: "stocks".to_string(),
            listen_addr: "127.0.0.1:7800".to_string(),
            advertise_addr: None,
            peers: HashMap::new(),
            rpc: RpcConfig::default(),
            membership: MembershipConfig::default(),
            state_transfer_timeout_ms: 30_000,
            lock_timeout_ms: None,
            quorum: QuorumPolicy::default(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            connect_timeout_ms: 1_000,
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            probe_timeout_ms: 500,
        }
    }
}

impl ClusterConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Load a configuration from a TOML file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> ClusterResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: ClusterConfig = toml::from_str(&text)?;
        config.validate().map_err(ClusterError::Config)?;
        Ok(config)
    }

    /// Per-member broadcast timeout.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.timeout_ms)
    }

    /// TCP connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.connect_timeout_ms)
    }

    /// Interval between liveness probes.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.membership.heartbeat_interval_ms)
    }

    /// Timeout for a single liveness probe.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.membership.probe_timeout_ms)
    }

    /// Bound on waiting for state at join time.
    pub fn state_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.state_transfer_timeout_ms)
    }

    /// Bound on distributed lock acquisition, if any.
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id == 0 {
            return Err("node_id must be > 0".to_string());
        }

        if self.listen_addr.is_empty() {
            return Err("listen_addr is required".to_string());
        }

        if let Some((id, _)) = self.peers.iter().find(|(_, addr)| addr.is_empty()) {
            return Err(format!("peer {} has an empty address", id));
        }

        if self.state_transfer_timeout_ms == 0 {
            return Err("state_transfer_timeout_ms must be > 0".to_string());
        }

        if self.rpc.timeout_ms == 0 {
            return Err("rpc.timeout_ms must be > 0".to_string());
        }

        // A probe that outlives the heartbeat would overlap the next one
        if self.membership.probe_timeout_ms >= self.membership.heartbeat_interval_ms {
            return Err(format!(
                "membership.probe_timeout_ms ({}) should be < heartbeat_interval_ms ({})",
                self.membership.probe_timeout_ms, self.membership.heartbeat_interval_ms
            ));
        }

        Ok(())
    }
}

fn serialize_peers<S>(peers: &HashMap<NodeId, String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(peers.len()))?;
    for (id, addr) in peers {
        map.serialize_entry(&id.to_string(), addr)?;
    }
    map.end()
}

fn deserialize_peers<'de, D>(deserializer: D) -> Result<HashMap<NodeId, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: HashMap<String, String> = serde::Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(id, addr)| {
            id.parse::<NodeId>()
                .map(|id| (id, addr))
                .map_err(|_| serde::de::Error::custom(format!("invalid peer id '{}'", id)))
        })
        .collect()
}

/// Builder for ClusterConfig.
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Set the node ID.
    pub fn node_id(mut self, id: NodeId) -> Self {
        self.config.node_id = id;
        self
    }

    /// Set the cluster name.
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.config.cluster_name = name.into();
        self
    }

    /// Set the listen address.
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the advertise address.
    pub fn advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.advertise_addr = Some(addr.into());
        self
    }

    /// Add a peer node.
    pub fn peer(mut self, node_id: NodeId, addr: impl Into<String>) -> Self {
        self.config.peers.insert(node_id, addr.into());
        self
    }

    /// Set all peers at once.
    pub fn peers(mut self, peers: impl IntoIterator<Item = (NodeId, String)>) -> Self {
        self.config.peers = peers.into_iter().collect();
        self
    }

    /// Set the per-member RPC timeout in milliseconds.
    pub fn rpc_timeout_ms(mut self, ms: u64) -> Self {
        self.config.rpc.timeout_ms = ms;
        self
    }

    /// Set heartbeat interval and probe timeout in milliseconds.
    pub fn heartbeat(mut self, interval_ms: u64, probe_timeout_ms: u64) -> Self {
        self.config.membership.heartbeat_interval_ms = interval_ms;
        self.config.membership.probe_timeout_ms = probe_timeout_ms;
        self
    }

    /// Set the state transfer deadline in milliseconds.
    pub fn state_transfer_timeout_ms(mut self, ms: u64) -> Self {
        self.config.state_transfer_timeout_ms = ms;
        self
    }

    /// Bound distributed lock acquisition.
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_timeout_ms = Some(ms);
        self
    }

    /// Set the CAS quorum policy.
    pub fn quorum(mut self, policy: QuorumPolicy) -> Self {
        self.config.quorum = policy;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<ClusterConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster_name, "stocks");
        assert_eq!(config.state_transfer_timeout(), Duration::from_secs(30));
        assert_eq!(config.lock_timeout(), None);
        assert_eq!(config.quorum, QuorumPolicy::ReceivedResponses);
    }

    #[test]
    fn test_builder_rejects_invalid() {
        assert!(ClusterConfig::builder().node_id(0).build().is_err());
        assert!(ClusterConfig::builder().peer(2, "").build().is_err());
        assert!(ClusterConfig::builder().heartbeat(100, 100).build().is_err());
    }

    #[test]
    fn test_advertise_addr_is_optional() {
        let config = ClusterConfig::builder()
            .listen_addr("0.0.0.0:7800")
            .build()
            .unwrap();
        assert_eq!(config.advertise_addr, None);

        let config = ClusterConfig::builder()
            .listen_addr("0.0.0.0:7800")
            .advertise_addr("10.0.0.5:7800")
            .build()
            .unwrap();
        assert_eq!(config.advertise_addr.as_deref(), Some("10.0.0.5:7800"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
node_id = 2
listen_addr = "127.0.0.1:7802"
lock_timeout_ms = 2500
quorum = "known_members"

[peers]
1 = "127.0.0.1:7801"
3 = "127.0.0.1:7803"

[rpc]
timeout_ms = 750
"#
        )
        .unwrap();

        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers.get(&3).map(String::as_str), Some("127.0.0.1:7803"));
        assert_eq!(config.rpc.timeout_ms, 750);
        // Unset sections keep their defaults
        assert_eq!(config.rpc.connect_timeout_ms, 1_000);
        assert_eq!(config.lock_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.quorum, QuorumPolicy::KnownMembers);
    }

    #[test]
    fn test_from_file_missing() {
        let err = ClusterConfig::from_file("/nonexistent/stockrep.toml").unwrap_err();
        assert!(matches!(err, ClusterError::Config(_)));
    }
}
