//! Abstraction over node-to-node data RPCs.
//!
//! Same pattern as `GossipTransport` in the cluster crate: a trait here,
//! with an in-process implementation in [`crate::local`].

use crate::error::KvError;
use dmap_cluster::node_info::NodeInfo;
use dmap_cluster::routing::RoutingTable;
use dmap_common::PartitionId;
use dmap_storage::{Entry, FragmentData};
use tokio::time::Duration;

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// Every request carries the sender's routing-table version so the receiver
/// can tell a stale sender from a stale receiver.
#[derive(Debug, Clone)]
pub enum ReplicaRequest {
    /// Read the receiver's copy of a key.
    Read {
        table_version: u64,
        partition: PartitionId,
        dmap: String,
        key: String,
    },
    /// Store a versioned entry unless the receiver holds a newer one.
    Write {
        table_version: u64,
        partition: PartitionId,
        dmap: String,
        entry: Entry,
    },
    /// Remove a key from a backup.
    Remove {
        table_version: u64,
        partition: PartitionId,
        dmap: String,
        key: String,
    },
    /// Run an operation on the partition's primary.
    Primary {
        table_version: u64,
        partition: PartitionId,
        op: PrimaryOp,
        /// Time left before the caller gives up.
        budget: Duration,
    },
    /// Drop every fragment of a map.
    Destroy { dmap: String },
    /// Bulk transfer of a partition to a new owner.
    Migrate {
        table_version: u64,
        partition: PartitionId,
        fragments: Vec<FragmentData>,
    },
}

impl ReplicaRequest {
    /// Label used for per-type RPC metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicaRequest::Read { .. } => "read",
            ReplicaRequest::Write { .. } => "write",
            ReplicaRequest::Remove { .. } => "remove",
            ReplicaRequest::Primary { op, .. } => op.kind(),
            ReplicaRequest::Destroy { .. } => "destroy",
            ReplicaRequest::Migrate { .. } => "migrate",
        }
    }
}

/// Operations that only the primary owner may execute.
#[derive(Debug, Clone)]
pub enum PrimaryOp {
    Put {
        dmap: String,
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Delete {
        dmap: String,
        key: String,
    },
    /// Add `delta` (negative for Decr).
    Incr {
        dmap: String,
        key: String,
        delta: i64,
    },
    GetPut {
        dmap: String,
        key: String,
        value: Vec<u8>,
    },
    Lock {
        dmap: String,
        key: String,
        session: String,
        ttl: Duration,
    },
    Unlock {
        dmap: String,
        key: String,
        session: String,
    },
}

impl PrimaryOp {
    pub fn kind(&self) -> &'static str {
        match self {
            PrimaryOp::Put { .. } => "put",
            PrimaryOp::Delete { .. } => "delete",
            PrimaryOp::Incr { .. } => "incr",
            PrimaryOp::GetPut { .. } => "getput",
            PrimaryOp::Lock { .. } => "lock",
            PrimaryOp::Unlock { .. } => "unlock",
        }
    }

    pub fn dmap(&self) -> &str {
        match self {
            PrimaryOp::Put { dmap, .. }
            | PrimaryOp::Delete { dmap, .. }
            | PrimaryOp::Incr { dmap, .. }
            | PrimaryOp::GetPut { dmap, .. }
            | PrimaryOp::Lock { dmap, .. }
            | PrimaryOp::Unlock { dmap, .. } => dmap,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            PrimaryOp::Put { key, .. }
            | PrimaryOp::Delete { key, .. }
            | PrimaryOp::Incr { key, .. }
            | PrimaryOp::GetPut { key, .. }
            | PrimaryOp::Lock { key, .. }
            | PrimaryOp::Unlock { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaResponse {
    /// Answer to `Read`. `None` when absent or expired.
    Entry(Option<Entry>),
    /// Answer to `Write`; `false` when the receiver already had a newer copy.
    Stored(bool),
    Ack,
    /// Previous value, for `GetPut`.
    Previous(Option<Vec<u8>>),
    /// New counter value, for `Incr`.
    Counter(i64),
    /// Entries accepted by a `Migrate`.
    Imported(usize),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicaError {
    #[error("RPC failed: {0}")]
    RpcFailed(String),

    #[error("timeout")]
    Timeout,

    /// The receiver does not own the partition. Carries its table so the
    /// sender can refresh.
    #[error("not an owner of partition {partition}")]
    StaleOwnership {
        partition: PartitionId,
        table: Box<RoutingTable>,
    },

    /// The primary ran the operation and it failed.
    #[error("rejected: {0}")]
    Rejected(KvError),
}

impl ReplicaError {
    /// Transport-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplicaError::RpcFailed(_) | ReplicaError::Timeout)
    }
}

/// Transport for data RPCs.
#[async_trait::async_trait]
pub trait ReplicaClient: Send + Sync + 'static {
    async fn send(
        &self,
        target: &NodeInfo,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, ReplicaError>;
}
