//! Holder of the current routing table.
//!
//! Readers capture an `Arc<RoutingTable>` snapshot and keep using it for the
//! whole operation; replacement is a single atomic swap inside a `watch`
//! channel, which also wakes subscribers such as the balancer.

use crate::node_info::NodeInfo;
use crate::routing::RoutingTable;
use dmap_common::PartitionId;
use std::sync::Arc;
use tokio::sync::watch;

pub struct Router {
    tx: watch::Sender<Arc<RoutingTable>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("version", &self.tx.borrow().version())
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(partition_count: u64, replica_count: usize) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(RoutingTable::empty(
            partition_count,
            replica_count,
        )));
        Self { tx }
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<RoutingTable> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RoutingTable>> {
        self.tx.subscribe()
    }

    pub fn partition_for(&self, dmap: &str, key: &str) -> PartitionId {
        self.tx.borrow().partition_for(dmap, key)
    }

    /// Recompute the assignment for `members`. A new version is installed
    /// only when the assignment differs from the current one.
    pub fn rebuild(&self, members: &[NodeInfo]) -> Option<Arc<RoutingTable>> {
        let mut installed = None;
        self.tx.send_if_modified(|current| {
            let candidate = RoutingTable::build(
                current.version() + 1,
                current.partition_count(),
                current.replica_count(),
                members,
            );
            if candidate.same_assignment(current) {
                return false;
            }
            let table = Arc::new(candidate);
            *current = table.clone();
            installed = Some(table);
            true
        });
        if let Some(table) = &installed {
            dmap_metrics::metrics()
                .routing_table_version
                .set(table.version() as i64);
            tracing::info!(
                version = table.version(),
                members = members.len(),
                "routing table rebuilt"
            );
        }
        installed
    }

    /// Install a table received from a peer if it is newer than ours.
    pub fn accept(&self, table: RoutingTable) -> bool {
        let mut accepted = false;
        self.tx.send_if_modified(|current| {
            if table.partition_count() != current.partition_count() {
                tracing::warn!(
                    ours = current.partition_count(),
                    theirs = table.partition_count(),
                    "rejecting routing table with a different partition count"
                );
                return false;
            }
            if table.version() <= current.version() {
                return false;
            }
            *current = Arc::new(table.clone());
            accepted = true;
            true
        });
        if accepted {
            dmap_metrics::metrics()
                .routing_table_version
                .set(table.version() as i64);
            tracing::debug!(version = table.version(), "accepted routing table");
        }
        accepted
    }
}
