//! Member status and the gossip record describing a status claim.

use crate::node_info::NodeInfo;
use dmap_common::NodeId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Health status of a member as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Alive => "alive",
            NodeStatus::Suspect => "suspect",
            NodeStatus::Dead => "dead",
            NodeStatus::Left => "left",
        }
    }

    /// Whether a member in this status still takes part in placement.
    pub fn is_live(&self) -> bool {
        matches!(self, NodeStatus::Alive | NodeStatus::Suspect)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status claim about one node, as carried by gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    pub node: NodeInfo,
    pub status: NodeStatus,
    pub incarnation: u64,
    /// Node that originated the claim. Distinct suspecters shorten the
    /// suspicion timeout.
    pub from: NodeId,
}

/// Local view of one member.
#[derive(Debug, Clone)]
pub struct Member {
    pub info: NodeInfo,
    pub status: NodeStatus,
    pub incarnation: u64,
    /// When `status` last changed.
    pub changed_at: Instant,
}

impl Member {
    pub fn to_update(&self, from: NodeId) -> MemberUpdate {
        MemberUpdate {
            node: self.info.clone(),
            status: self.status,
            incarnation: self.incarnation,
            from,
        }
    }
}
