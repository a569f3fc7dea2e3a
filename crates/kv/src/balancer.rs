//! Partition rebalancing after ownership changes.
//!
//! Each pass compares the current routing table with the one seen by the
//! previous pass. Partitions that gained owners are copied to the new
//! owners; partitions this node no longer owns are copied to every current
//! owner and dropped locally only once all of them acknowledged. Failed
//! transfers stay pending and are retried on the next pass.

use crate::coordinator::{send_with_retry, Coordinator};
use crate::error::KvError;
use crate::replica_client::{ReplicaClient, ReplicaRequest, ReplicaResponse};
use dmap_cluster::node_info::NodeInfo;
use dmap_cluster::routing::RoutingTable;
use dmap_common::PartitionId;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one balancing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceReport {
    /// Partition copies acknowledged by a new owner.
    pub transferred: usize,
    /// Partitions handed off and dropped locally.
    pub dropped: usize,
    /// Partitions left pending after a failed transfer.
    pub failed: usize,
}

#[derive(Debug)]
struct BalancerState {
    last: Arc<RoutingTable>,
    pending: HashSet<PartitionId>,
}

pub struct Balancer<R: ReplicaClient> {
    coordinator: Arc<Coordinator<R>>,
    state: Mutex<BalancerState>,
}

impl<R: ReplicaClient> std::fmt::Debug for Balancer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("local", self.coordinator.local())
            .finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> Balancer<R> {
    /// The table current at construction is the baseline of the first pass.
    pub fn new(coordinator: Arc<Coordinator<R>>) -> Self {
        let last = coordinator.view().routing_table();
        Self {
            coordinator,
            state: Mutex::new(BalancerState {
                last,
                pending: HashSet::new(),
            }),
        }
    }

    /// Partitions whose last transfer failed.
    pub async fn pending(&self) -> Vec<PartitionId> {
        let mut pending: Vec<_> = self.state.lock().await.pending.iter().copied().collect();
        pending.sort_unstable();
        pending
    }

    /// Run one pass against the current routing table.
    pub async fn run_once(&self) -> BalanceReport {
        let mut state = self.state.lock().await;
        let coordinator = &self.coordinator;
        let table = coordinator.view().routing_table();
        let local = coordinator.local().id;
        let mut report = BalanceReport::default();

        for partition in coordinator.storage().partitions_with_data().await {
            let owners = table.owners_of(partition);
            let retry = state.pending.contains(&partition);
            let still_owner = table.is_owner(partition, &local);

            let targets: Vec<NodeInfo> = owners
                .iter()
                .filter(|o| o.id != local)
                .filter(|o| !still_owner || retry || !state.last.is_owner(partition, &o.id))
                .cloned()
                .collect();
            if targets.is_empty() {
                if !still_owner && owners.is_empty() {
                    // No live owner to hand off to; keep the data.
                    state.pending.insert(partition);
                    report.failed += 1;
                }
                continue;
            }

            match self.transfer(&table, partition, &targets).await {
                Ok(acked) => {
                    report.transferred += acked;
                    state.pending.remove(&partition);
                    if !still_owner {
                        let removed = coordinator.storage().drop_partition(partition).await;
                        report.dropped += 1;
                        debug!(partition, removed, "dropped handed-off partition");
                    }
                }
                Err(e) => {
                    warn!(partition, "{}", e);
                    state.pending.insert(partition);
                    report.failed += 1;
                }
            }
        }

        state.last = table;
        if report != BalanceReport::default() {
            info!(
                transferred = report.transferred,
                dropped = report.dropped,
                failed = report.failed,
                "balancer pass"
            );
        }
        report
    }

    /// Copy `partition` to every node in `targets`. Succeeds only when all
    /// of them acknowledged.
    async fn transfer(
        &self,
        table: &RoutingTable,
        partition: PartitionId,
        targets: &[NodeInfo],
    ) -> Result<usize, KvError> {
        let coordinator = &self.coordinator;
        let fragments = coordinator.storage().export_partition(partition).await;
        if fragments.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + coordinator.config().operation_timeout;
        let policy = coordinator.config().retry_policy();
        let metrics = dmap_metrics::metrics();

        let sends = targets.iter().map(|target| {
            let request = ReplicaRequest::Migrate {
                table_version: table.version(),
                partition,
                fragments: fragments.clone(),
            };
            send_with_retry(&**coordinator.client(), target, request, policy, deadline)
        });
        let results = futures::future::join_all(sends).await;

        let mut acked = 0;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(ReplicaResponse::Imported(n)) => {
                    metrics.migrations.with_label_values(&["ok"]).inc();
                    debug!(partition, peer = %target, imported = n, "partition migrated");
                    acked += 1;
                }
                Ok(other) => {
                    metrics.migrations.with_label_values(&["failed"]).inc();
                    debug!(partition, peer = %target, "unexpected migrate response: {:?}", other);
                }
                Err(e) => {
                    metrics.migrations.with_label_values(&["failed"]).inc();
                    debug!(partition, peer = %target, "migrate failed: {}", e);
                }
            }
        }
        if acked < targets.len() {
            return Err(KvError::MigrationFailed(partition));
        }
        Ok(acked)
    }

    /// Run a pass every `every`, and shortly after each routing-table change.
    pub fn spawn(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let balancer = self.clone();
        let mut changes = self.coordinator.view().router().subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        balancer.run_once().await;
                    }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // Coalesce bursts of churn into one pass.
                        ticker.reset();
                    }
                }
            }
            debug!("balancer stopped");
        })
    }
}
