//! dmap-cluster: membership, failure detection and partition placement.
//!
//! [`ClusterService`] runs the SWIM protocol over a pluggable
//! [`GossipTransport`]: periodic direct probes with indirect fallback,
//! epidemic dissemination of status changes, suspicion timeouts, and
//! retention-based removal. Every change in the set of live members rebuilds
//! the routing table held by the [`router::Router`]; the oldest live member
//! pushes its table to the rest of the cluster.

pub mod chaos;
pub mod local;
pub mod member;
pub mod membership;
pub mod node_info;
pub mod router;
pub mod routing;
pub mod rpc;

use member::{MemberUpdate, NodeStatus};
use membership::{Membership, MembershipConfig, MembershipEvent};
use node_info::NodeInfo;
use router::Router;
use routing::RoutingTable;
use rpc::{GossipRequest, GossipResponse, GossipTransport};

use dmap_common::ClusterError;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub partition_count: u64,
    pub replica_count: usize,
    pub probe_interval: Duration,
    /// Timeout of a single direct probe.
    pub probe_timeout: Duration,
    pub gossip_interval: Duration,
    /// Peers contacted per gossip round.
    pub gossip_nodes: usize,
    pub indirect_checks: usize,
    pub retransmit_mult: usize,
    pub suspicion_mult: u32,
    pub suspicion_max_timeout_mult: u32,
    pub leave_timeout: Duration,
    pub max_gossip_digest: usize,
    /// Interval of the coordinator's routing-table push.
    pub push_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            partition_count: 271,
            replica_count: 1,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            indirect_checks: 3,
            retransmit_mult: 4,
            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,
            leave_timeout: Duration::from_secs(5),
            max_gossip_digest: 32,
            push_interval: Duration::from_secs(60),
        }
    }
}

impl ClusterConfig {
    fn membership_config(&self) -> MembershipConfig {
        MembershipConfig {
            probe_interval: self.probe_interval,
            indirect_checks: self.indirect_checks,
            retransmit_mult: self.retransmit_mult,
            suspicion_mult: self.suspicion_mult,
            suspicion_max_timeout_mult: self.suspicion_max_timeout_mult,
            leave_timeout: self.leave_timeout,
            max_gossip_digest: self.max_gossip_digest,
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster view
// ---------------------------------------------------------------------------

/// Status of one member, for diagnostics.
#[derive(Debug, Clone)]
pub struct MemberSnapshot {
    pub info: NodeInfo,
    pub status: NodeStatus,
    pub incarnation: u64,
}

/// Membership and routing state shared by the cluster service and the data
/// path. Transport-independent.
pub struct ClusterView {
    local: NodeInfo,
    membership: RwLock<Membership>,
    router: Router,
}

impl std::fmt::Debug for ClusterView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterView")
            .field("local", &self.local)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl ClusterView {
    /// A single-member view owning every partition.
    pub fn new(local: NodeInfo, config: &ClusterConfig) -> Self {
        let membership = Membership::new(local.clone(), config.membership_config());
        let router = Router::new(config.partition_count, config.replica_count);
        router.rebuild(&[local.clone()]);
        Self {
            local,
            membership: RwLock::new(membership),
            router,
        }
    }

    pub fn local(&self) -> &NodeInfo {
        &self.local
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.router.current()
    }

    pub async fn live_nodes(&self) -> Vec<NodeInfo> {
        self.membership.read().await.live_nodes()
    }

    /// Number of members taking part in placement, the local node included.
    pub async fn live_count(&self) -> usize {
        self.membership.read().await.live_count()
    }

    pub async fn is_coordinator(&self) -> bool {
        self.membership
            .read()
            .await
            .coordinator()
            .is_some_and(|c| c.id == self.local.id)
    }

    pub async fn snapshot(&self) -> Vec<MemberSnapshot> {
        let m = self.membership.read().await;
        let mut out = vec![MemberSnapshot {
            info: self.local.clone(),
            status: if m.is_leaving() {
                NodeStatus::Left
            } else {
                NodeStatus::Alive
            },
            incarnation: m.incarnation(),
        }];
        out.extend(m.members().map(|member| MemberSnapshot {
            info: member.info.clone(),
            status: member.status,
            incarnation: member.incarnation,
        }));
        out
    }

    /// Rebuild the routing table from the current live members.
    pub async fn refresh_routing(&self) -> Option<Arc<RoutingTable>> {
        let nodes = self.live_nodes().await;
        self.router.rebuild(&nodes)
    }

    /// Apply gossiped claims. Returns the new routing table when placement
    /// changed.
    pub async fn apply(&self, updates: Vec<MemberUpdate>) -> Option<Arc<RoutingTable>> {
        if updates.is_empty() {
            return None;
        }
        let events = {
            let mut m = self.membership.write().await;
            let now = Instant::now();
            updates
                .into_iter()
                .flat_map(|u| m.apply(u, now))
                .collect::<Vec<_>>()
        };
        self.settle(events).await
    }

    async fn settle(&self, events: Vec<MembershipEvent>) -> Option<Arc<RoutingTable>> {
        let metrics = dmap_metrics::metrics();
        let mut placement_changed = false;
        for event in &events {
            match event {
                MembershipEvent::Joined(node) => {
                    tracing::info!(node = %node, "member joined");
                    metrics
                        .member_transitions
                        .with_label_values(&["alive"])
                        .inc();
                }
                MembershipEvent::StatusChanged { node, from, to } => {
                    tracing::info!(node = %node, from = %from, to = %to, "member status changed");
                    metrics
                        .member_transitions
                        .with_label_values(&[to.as_str()])
                        .inc();
                }
                MembershipEvent::Refuted { incarnation } => {
                    tracing::info!(incarnation, "refuted claim about local node");
                }
                MembershipEvent::Removed(node) => {
                    tracing::info!(node = %node, "member removed");
                    metrics
                        .member_transitions
                        .with_label_values(&["removed"])
                        .inc();
                }
            }
            placement_changed |= event.changes_placement();
        }
        if placement_changed {
            self.refresh_routing().await
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster service
// ---------------------------------------------------------------------------

/// Runs membership and routing-table distribution for one node.
///
/// Generic over `T: GossipTransport` for testability.
pub struct ClusterService<T: GossipTransport> {
    view: Arc<ClusterView>,
    transport: Arc<T>,
    config: ClusterConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: GossipTransport> std::fmt::Debug for ClusterService<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterService")
            .field("local", self.view.local())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: GossipTransport> ClusterService<T> {
    pub fn new(local: NodeInfo, transport: T, config: ClusterConfig) -> Self {
        Self {
            view: Arc::new(ClusterView::new(local, &config)),
            transport: Arc::new(transport),
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn view(&self) -> &Arc<ClusterView> {
        &self.view
    }

    pub fn local_info(&self) -> &NodeInfo {
        self.view.local()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    async fn send(
        &self,
        target: &NodeInfo,
        request: GossipRequest,
        within: Duration,
    ) -> Result<GossipResponse, ClusterError> {
        dmap_metrics::record_rpc(request.kind());
        match tokio::time::timeout(within, self.transport.send_request(target, request)).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout(target.id)),
        }
    }

    async fn merge(&self, updates: Vec<MemberUpdate>) {
        if let Some(table) = self.view.apply(updates).await {
            self.push_if_coordinator(table).await;
        }
    }

    async fn push_if_coordinator(&self, table: Arc<RoutingTable>) {
        if self.view.is_coordinator().await {
            tokio::spawn(push_table(
                self.view.clone(),
                self.transport.clone(),
                table,
                self.config.probe_timeout,
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Join / leave
    // -----------------------------------------------------------------------

    /// Join the cluster through the given seed addresses.
    ///
    /// Each reachable seed answers with its full member list and routing
    /// table. Returns the number of seeds that answered. Fails only if seeds
    /// were given and none answered.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize, ClusterError> {
        let update = self.view.membership.read().await.local_update();
        let mut joined = 0;
        let mut last_err = None;

        for addr in seeds {
            if *addr == self.view.local().addr {
                continue;
            }
            let seed = NodeInfo::seed(*addr);
            let request = GossipRequest::Join {
                update: update.clone(),
            };
            match self.send(&seed, request, self.config.probe_timeout).await {
                Ok(GossipResponse::Welcome { members, table }) => {
                    self.view.router.accept(table);
                    self.merge(members).await;
                    joined += 1;
                }
                Ok(other) => {
                    tracing::warn!(seed = %addr, "unexpected join response: {:?}", other);
                }
                Err(e) => {
                    tracing::warn!(seed = %addr, "join attempt failed: {}", e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if joined == 0 => Err(e),
            _ => {
                tracing::info!(seeds = joined, "joined cluster");
                Ok(joined)
            }
        }
    }

    /// Announce departure to every live peer.
    pub async fn leave(&self) {
        let update = self.view.membership.write().await.leave();
        let peers: Vec<NodeInfo> = self
            .view
            .live_nodes()
            .await
            .into_iter()
            .filter(|n| n.id != self.view.local().id)
            .collect();

        let sends = peers.iter().map(|peer| {
            let request = GossipRequest::Gossip {
                sender: self.view.local().clone(),
                updates: vec![update.clone()],
            };
            self.send(peer, request, self.config.probe_timeout)
        });
        let results = futures::future::join_all(sends).await;
        let delivered = results.iter().filter(|r| r.is_ok()).count();
        tracing::info!(peers = peers.len(), delivered, "left cluster");
    }

    // -----------------------------------------------------------------------
    // Protocol rounds
    // -----------------------------------------------------------------------

    /// Probe one member: directly, then through `indirect_checks` helpers.
    /// A member that answers neither way becomes suspect.
    pub async fn probe_once(&self) {
        let (target, updates) = {
            let mut m = self.view.membership.write().await;
            let Some(target) = m.next_probe_target() else {
                return;
            };
            (target, m.digest())
        };

        let ping = GossipRequest::Ping {
            sender: self.view.local().clone(),
            updates,
        };
        if let Ok(GossipResponse::Ack { updates, .. }) =
            self.send(&target, ping, self.config.probe_timeout).await
        {
            self.merge(updates).await;
            return;
        }
        tracing::debug!(peer = %target, "direct probe failed, trying indirect probes");

        let helpers = self
            .view
            .membership
            .read()
            .await
            .random_peers(self.config.indirect_checks, &[target.id]);

        let deadline = Instant::now() + self.config.probe_timeout * 2;
        let mut futs = FuturesUnordered::new();
        for helper in helpers {
            let transport = self.transport.clone();
            let request = GossipRequest::PingReq {
                sender: self.view.local().clone(),
                target: target.clone(),
                updates: vec![],
            };
            dmap_metrics::record_rpc(request.kind());
            futs.push(tokio::spawn(async move {
                match tokio::time::timeout_at(deadline, transport.send_request(&helper, request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ClusterError::Timeout(helper.id)),
                }
            }));
        }

        let mut acked = false;
        while let Some(result) = tokio::time::timeout_at(deadline, futs.next())
            .await
            .ok()
            .flatten()
        {
            if let Ok(Ok(GossipResponse::Ack { .. })) = result {
                acked = true;
                break;
            }
        }

        if !acked {
            tracing::warn!(peer = %target, "probe failed, suspecting member");
            let events = self
                .view
                .membership
                .write()
                .await
                .suspect(&target.id, Instant::now());
            if let Some(table) = self.view.settle(events).await {
                self.push_if_coordinator(table).await;
            }
        }
    }

    /// Send pending updates to `gossip_nodes` random peers.
    pub async fn gossip_once(&self) {
        let (peers, updates) = {
            let mut m = self.view.membership.write().await;
            let peers = m.random_peers(self.config.gossip_nodes, &[]);
            if peers.is_empty() || m.pending_broadcasts() == 0 {
                return;
            }
            (peers, m.digest())
        };

        let sends = peers.iter().map(|peer| {
            let request = GossipRequest::Gossip {
                sender: self.view.local().clone(),
                updates: updates.clone(),
            };
            self.send(peer, request, self.config.probe_timeout)
        });
        for (peer, result) in peers.iter().zip(futures::future::join_all(sends).await) {
            if let Err(e) = result {
                tracing::debug!(peer = %peer, "gossip send failed: {}", e);
            }
        }
    }

    /// Advance suspicion and retention timers.
    pub async fn tick_once(&self) {
        let events = self.view.membership.write().await.tick(Instant::now());
        if let Some(table) = self.view.settle(events).await {
            self.push_if_coordinator(table).await;
        }
    }

    /// Push the current routing table if this node is the coordinator.
    pub async fn push_once(&self) {
        if self.view.is_coordinator().await {
            push_table(
                self.view.clone(),
                self.transport.clone(),
                self.view.routing_table(),
                self.config.probe_timeout,
            )
            .await;
        }
    }

    // -----------------------------------------------------------------------
    // Request handling (incoming RPCs)
    // -----------------------------------------------------------------------

    /// Handle an incoming membership RPC.
    pub async fn handle_request(&self, request: GossipRequest) -> GossipResponse {
        match request {
            GossipRequest::Ping { updates, .. } => {
                self.merge(updates).await;
                GossipResponse::Ack {
                    responder: self.view.local().clone(),
                    updates: self.view.membership.write().await.digest(),
                }
            }

            GossipRequest::PingReq {
                target, updates, ..
            } => {
                self.merge(updates).await;
                let ping = GossipRequest::Ping {
                    sender: self.view.local().clone(),
                    updates: vec![],
                };
                match self.send(&target, ping, self.config.probe_timeout).await {
                    Ok(GossipResponse::Ack { updates, .. }) => {
                        self.merge(updates).await;
                        GossipResponse::Ack {
                            responder: self.view.local().clone(),
                            updates: vec![],
                        }
                    }
                    _ => GossipResponse::Nack {
                        responder: self.view.local().clone(),
                    },
                }
            }

            GossipRequest::Gossip { updates, .. } => {
                self.merge(updates).await;
                GossipResponse::Ok
            }

            GossipRequest::Join { update } => {
                self.merge(vec![update]).await;
                GossipResponse::Welcome {
                    members: self.view.membership.read().await.full_state(),
                    table: (*self.view.routing_table()).clone(),
                }
            }

            GossipRequest::PushTable { sender, table } => {
                let current = self.view.routing_table();
                let differs = !table.same_assignment(&current);
                if !self.view.router.accept(table) && differs {
                    // Our view disagrees with the coordinator's at an equal or
                    // higher version; recompute from local membership.
                    tracing::debug!(from = %sender, "pushed table not newer, rebuilding locally");
                    self.view.refresh_routing().await;
                }
                GossipResponse::Ok
            }
        }
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    /// Spawn the probe, gossip, timer and table-push loops.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_loop("probe", self.config.probe_interval, |s| async move {
            s.probe_once().await
        }));
        tasks.push(self.spawn_loop("gossip", self.config.gossip_interval, |s| async move {
            s.gossip_once().await
        }));
        tasks.push(self.spawn_loop(
            "suspicion",
            self.config.probe_interval / 2,
            |s| async move { s.tick_once().await },
        ));
        tasks.push(self.spawn_loop("table_push", self.config.push_interval, |s| async move {
            s.push_once().await
        }));
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, every: Duration, f: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let service = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every.max(Duration::from_millis(1)));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => f(service.clone()).await,
                }
            }
            tracing::debug!(task = name, "cluster task stopped");
        })
    }

    /// Stop background loops and wait for them to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn push_table<T: GossipTransport>(
    view: Arc<ClusterView>,
    transport: Arc<T>,
    table: Arc<RoutingTable>,
    within: Duration,
) {
    let peers: Vec<NodeInfo> = view
        .live_nodes()
        .await
        .into_iter()
        .filter(|n| n.id != view.local().id)
        .collect();
    let sends = peers.iter().map(|peer| {
        let request = GossipRequest::PushTable {
            sender: view.local().clone(),
            table: (*table).clone(),
        };
        dmap_metrics::record_rpc(request.kind());
        tokio::time::timeout(within, transport.send_request(peer, request))
    });
    let results = futures::future::join_all(sends).await;
    let failed = results.iter().filter(|r| !matches!(r, Ok(Ok(_)))).count();
    if failed > 0 {
        tracing::debug!(version = table.version(), failed, "routing table push incomplete");
    }
}

// ---------------------------------------------------------------------------
// End-to-end tests
// ---------------------------------------------------------------------------
