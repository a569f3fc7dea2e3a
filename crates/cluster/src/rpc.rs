//! Membership RPC types and the transport abstraction trait.

use crate::member::MemberUpdate;
use crate::node_info::NodeInfo;
use crate::routing::RoutingTable;
use dmap_common::ClusterError;

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum GossipRequest {
    /// Direct health probe carrying piggybacked updates.
    Ping {
        sender: NodeInfo,
        updates: Vec<MemberUpdate>,
    },
    /// Ask the receiver to probe `target` on the sender's behalf.
    PingReq {
        sender: NodeInfo,
        target: NodeInfo,
        updates: Vec<MemberUpdate>,
    },
    /// Periodic epidemic dissemination.
    Gossip {
        sender: NodeInfo,
        updates: Vec<MemberUpdate>,
    },
    /// A node entering the cluster announces itself.
    Join { update: MemberUpdate },
    /// The coordinator distributes its routing table.
    PushTable {
        sender: NodeInfo,
        table: RoutingTable,
    },
}

impl GossipRequest {
    /// Return the sender info from any request variant.
    pub fn sender(&self) -> &NodeInfo {
        match self {
            GossipRequest::Ping { sender, .. } => sender,
            GossipRequest::PingReq { sender, .. } => sender,
            GossipRequest::Gossip { sender, .. } => sender,
            GossipRequest::Join { update } => &update.node,
            GossipRequest::PushTable { sender, .. } => sender,
        }
    }

    /// Label used for per-type RPC metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GossipRequest::Ping { .. } => "ping",
            GossipRequest::PingReq { .. } => "ping_req",
            GossipRequest::Gossip { .. } => "gossip",
            GossipRequest::Join { .. } => "join",
            GossipRequest::PushTable { .. } => "push_table",
        }
    }
}

#[derive(Debug, Clone)]
pub enum GossipResponse {
    Ack {
        responder: NodeInfo,
        updates: Vec<MemberUpdate>,
    },
    /// The indirect probe target did not answer.
    Nack { responder: NodeInfo },
    /// Full membership state for a joining node.
    Welcome {
        members: Vec<MemberUpdate>,
        table: RoutingTable,
    },
    Ok,
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstraction over the network used for membership traffic.
#[async_trait::async_trait]
pub trait GossipTransport: Send + Sync + 'static {
    /// Send a request to a target node and await the response.
    async fn send_request(
        &self,
        target: &NodeInfo,
        request: GossipRequest,
    ) -> Result<GossipResponse, ClusterError>;
}
