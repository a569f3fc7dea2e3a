//! Partitioned, replicated maps on top of the cluster layer.
//!
//! Provides: named maps ([`DMap`]) whose keys hash to partitions, a
//! primary-backup replication scheme with tunable read and write quorums,
//! atomic counters and get-and-set under per-key locks, advisory client
//! locks, read repair, and rebalancing of partitions when ownership moves.
//! A [`Node`] wires all of it together with the membership service.

pub mod balancer;
pub mod chaos;
pub mod coordinator;
pub mod dmap;
pub mod error;
pub mod local;
pub mod lock;
pub mod node;
pub mod replica_client;

pub use coordinator::{Coordinator, QuorumConfig};
pub use dmap::DMap;
pub use error::KvError;
pub use local::LocalReplicaNetwork;
pub use node::{Node, NodeStats};
pub use replica_client::{ReplicaClient, ReplicaError, ReplicaRequest, ReplicaResponse};
