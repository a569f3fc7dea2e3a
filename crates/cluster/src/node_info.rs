//! Information about a cluster member.

use dmap_common::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Descriptor for a node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// The node's identifier, derived from `addr`.
    pub id: NodeId,
    /// Address the node listens on.
    pub addr: SocketAddr,
    /// Wall-clock start time in milliseconds. The oldest member coordinates
    /// routing-table distribution.
    pub birthdate_ms: u64,
}

impl NodeInfo {
    /// Describe a node starting now on `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_birthdate(addr, dmap_common::unix_millis())
    }

    pub fn with_birthdate(addr: SocketAddr, birthdate_ms: u64) -> Self {
        Self {
            id: NodeId::from_addr(&addr),
            addr,
            birthdate_ms,
        }
    }

    /// A peer known only by address, e.g. a configured join seed.
    pub fn seed(addr: SocketAddr) -> Self {
        Self::with_birthdate(addr, 0)
    }

    /// Ordering key for coordinator election: older first, then lower id.
    pub fn seniority(&self) -> (u64, NodeId) {
        (self.birthdate_ms, self.id)
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeInfo {}

impl std::hash::Hash for NodeInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}
