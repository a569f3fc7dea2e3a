//! An embedded cluster member: membership, storage, coordinator and the
//! background tasks that keep them in shape.

use crate::balancer::Balancer;
use crate::coordinator::{Coordinator, QuorumConfig};
use crate::dmap::DMap;
use crate::error::KvError;
use crate::lock::LockManager;
use crate::replica_client::ReplicaClient;
use dmap_cluster::member::NodeStatus;
use dmap_cluster::node_info::NodeInfo;
use dmap_cluster::rpc::GossipTransport;
use dmap_cluster::{ClusterConfig, ClusterService};
use dmap_common::PartitionId;
use dmap_config::{EvictionPolicyName, NodeConfig, ResolvedDMapConfig};
use dmap_storage::{EvictionPolicy, EvictionSettings, StorageConfig, StorageEngine};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Admission gate
// ---------------------------------------------------------------------------

/// Admits client operations until closed and tracks the ones in flight.
#[derive(Debug, Default)]
pub struct OpGate {
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Held for the duration of one admitted operation.
#[derive(Debug)]
pub struct OpPermit<'a> {
    gate: &'a OpGate,
}

impl Drop for OpPermit<'_> {
    fn drop(&mut self) {
        if self.gate.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gate.drained.notify_waiters();
        }
    }
}

impl OpGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> Result<OpPermit<'_>, KvError> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let permit = OpPermit { gate: self };
        if self.closed.load(Ordering::Acquire) {
            return Err(KvError::ShuttingDown);
        }
        Ok(permit)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no admitted operation is left.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Config conversion
// ---------------------------------------------------------------------------

pub fn cluster_config(config: &NodeConfig) -> ClusterConfig {
    let server = &config.server;
    let memberlist = &config.memberlist;
    ClusterConfig {
        partition_count: server.partition_count,
        replica_count: server.replica_count,
        probe_interval: Duration::from_millis(memberlist.probe_interval_ms),
        probe_timeout: Duration::from_millis(memberlist.probe_timeout_ms),
        gossip_interval: Duration::from_millis(memberlist.gossip_interval_ms),
        gossip_nodes: memberlist.gossip_nodes,
        indirect_checks: memberlist.indirect_checks,
        retransmit_mult: memberlist.retransmit_mult,
        suspicion_mult: memberlist.suspicion_mult,
        suspicion_max_timeout_mult: memberlist.suspicion_max_timeout_mult,
        leave_timeout: Duration::from_millis(server.leave_timeout_ms),
        max_gossip_digest: memberlist.max_gossip_digest,
        push_interval: Duration::from_millis(server.routing_table_push_interval_ms),
    }
}

fn eviction_settings(resolved: ResolvedDMapConfig) -> EvictionSettings {
    EvictionSettings {
        policy: match resolved.eviction_policy {
            EvictionPolicyName::None => EvictionPolicy::None,
            EvictionPolicyName::Ttl => EvictionPolicy::Ttl,
            EvictionPolicyName::Lru => EvictionPolicy::Lru,
        },
        max_idle_ms: resolved.max_idle_duration_ms,
        ttl_ms: resolved.ttl_duration_ms,
        max_keys: resolved.max_keys,
        max_inuse: resolved.max_inuse,
        lru_samples: resolved.lru_samples,
    }
}

pub fn storage_config(config: &NodeConfig) -> StorageConfig {
    let mut storage = StorageConfig::new(config.server.partition_count);
    // The empty name never matches a custom entry, so it resolves to the
    // global settings.
    storage.defaults = eviction_settings(config.dmaps.resolve(""));
    storage.overrides = config
        .dmaps
        .custom
        .keys()
        .map(|name| (name.clone(), eviction_settings(config.dmaps.resolve(name))))
        .collect();
    storage
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Diagnostics snapshot of one node.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub local: NodeInfo,
    pub is_coordinator: bool,
    pub members: Vec<(NodeInfo, NodeStatus)>,
    pub routing_table_version: u64,
    /// Partitions this node is primary of.
    pub primary_partitions: Vec<PartitionId>,
    /// Partitions this node holds as a backup.
    pub backup_partitions: Vec<PartitionId>,
    pub keys: usize,
    pub fragments: usize,
    pub inuse_bytes: usize,
    pub locks: usize,
    pub in_flight: usize,
}

/// One member of the cluster, wired over a gossip transport `G` and a data
/// transport `R`.
pub struct Node<G: GossipTransport, R: ReplicaClient> {
    config: NodeConfig,
    cluster: Arc<ClusterService<G>>,
    coordinator: Arc<Coordinator<R>>,
    balancer: Arc<Balancer<R>>,
    gate: Arc<OpGate>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<G: GossipTransport, R: ReplicaClient> std::fmt::Debug for Node<G, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local", self.cluster.local_info())
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl<G: GossipTransport, R: ReplicaClient> Node<G, R> {
    /// A node identified by its configured bind address.
    pub fn new(config: NodeConfig, gossip: G, replicas: R) -> Self {
        let info = NodeInfo::new(config.memberlist.bind_addr);
        Self::with_identity(config, info, gossip, replicas)
    }

    pub fn with_identity(config: NodeConfig, info: NodeInfo, gossip: G, replicas: R) -> Self {
        let cluster = Arc::new(ClusterService::new(info, gossip, cluster_config(&config)));
        let storage = Arc::new(StorageEngine::new(storage_config(&config)));
        let coordinator = Arc::new(Coordinator::new(
            cluster.view().clone(),
            storage,
            Arc::new(LockManager::new()),
            Arc::new(replicas),
            QuorumConfig::from(&config.server),
        ));
        let balancer = Arc::new(Balancer::new(coordinator.clone()));
        Self {
            config,
            cluster,
            coordinator,
            balancer,
            gate: Arc::new(OpGate::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn info(&self) -> &NodeInfo {
        self.cluster.local_info()
    }

    pub fn cluster(&self) -> &Arc<ClusterService<G>> {
        &self.cluster
    }

    pub fn coordinator(&self) -> &Arc<Coordinator<R>> {
        &self.coordinator
    }

    pub fn balancer(&self) -> &Arc<Balancer<R>> {
        &self.balancer
    }

    /// Handle to the map `name`. Maps need no creation step.
    pub fn dmap(&self, name: &str) -> DMap<R> {
        DMap::new(name, self.coordinator.clone(), self.gate.clone())
    }

    /// Join the configured peers and start every background task.
    ///
    /// A node whose peers are all unreachable starts as a cluster of one;
    /// gossip from peers that come up later brings it into their view.
    pub async fn start(&self) {
        let peers: Vec<SocketAddr> = self
            .config
            .memberlist
            .peers
            .iter()
            .filter_map(|p| match p.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(peer = %p, "ignoring unparsable peer address: {}", e);
                    None
                }
            })
            .collect();
        if !peers.is_empty() {
            match self.cluster.join(&peers).await {
                Ok(n) => debug!(seeds = n, "join complete"),
                Err(e) => warn!("no peer answered the join, starting alone: {}", e),
            }
        }
        self.cluster.start().await;

        let server = &self.config.server;
        let dmaps = &self.config.dmaps;
        let mut tasks = self.tasks.lock().await;
        tasks.extend(dmap_storage::eviction::spawn_eviction_workers(
            self.coordinator.storage().clone(),
            dmaps.num_eviction_workers,
            Duration::from_millis(dmaps.eviction_interval_ms),
            self.cancel.child_token(),
        ));
        tasks.push(spawn_lock_reaper(
            self.coordinator.locks().clone(),
            Duration::from_millis(server.lock_reap_interval_ms),
            self.cancel.child_token(),
        ));
        tasks.push(self.balancer.spawn(
            Duration::from_millis(server.trigger_balancer_interval_ms),
            self.cancel.child_token(),
        ));
        info!(node = %self.info(), "node started");
    }

    pub async fn stats(&self) -> NodeStats {
        let view = self.cluster.view();
        let table = view.routing_table();
        let local = self.info().id;
        let (primary_partitions, backup_partitions): (Vec<PartitionId>, Vec<PartitionId>) = table
            .partitions_owned_by(&local)
            .into_iter()
            .partition(|p| table.primary_of(*p).is_some_and(|n| n.id == local));
        let storage = self.coordinator.storage().stats().await;
        NodeStats {
            local: self.info().clone(),
            is_coordinator: view.is_coordinator().await,
            members: view
                .snapshot()
                .await
                .into_iter()
                .map(|m| (m.info, m.status))
                .collect(),
            routing_table_version: table.version(),
            primary_partitions,
            backup_partitions,
            keys: storage.keys,
            fragments: storage.fragments,
            inuse_bytes: storage.inuse,
            locks: self.coordinator.locks().len(),
            in_flight: self.gate.in_flight(),
        }
    }

    /// Leave the cluster gracefully.
    ///
    /// New operations fail with `ShuttingDown` at once. Operations already
    /// admitted get until `deadline` to finish. The node then announces
    /// that it left, hands its partitions to their new owners (also bounded
    /// by `deadline`) and stops its background tasks.
    pub async fn shutdown(&self, deadline: Instant) {
        self.gate.close();
        if tokio::time::timeout_at(deadline, self.gate.wait_drained())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.gate.in_flight(),
                "shutdown deadline reached with operations in flight"
            );
        }

        self.cluster.leave().await;
        self.cluster.view().refresh_routing().await;
        match tokio::time::timeout_at(deadline, self.balancer.run_once()).await {
            Ok(report) if report.failed > 0 => {
                warn!(failed = report.failed, "some partitions were not handed off")
            }
            Ok(_) => {}
            Err(_) => warn!("shutdown deadline reached during partition hand-off"),
        }

        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.cluster.stop().await;
        info!(node = %self.info(), "node stopped");
    }
}

/// Periodically drop expired lock records.
fn spawn_lock_reaper(
    locks: Arc<LockManager>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = locks.reap_expired();
                    if reaped > 0 {
                        debug!(reaped, "reaped expired locks");
                    }
                }
            }
        }
    })
}
