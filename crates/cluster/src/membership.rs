//! SWIM membership state machine.
//!
//! [`Membership`] holds the local view of the cluster and applies status
//! claims according to incarnation-number precedence. It does no I/O and
//! never reads the clock itself: every time-dependent operation takes `now`,
//! so a scripted sequence of probes and gossip can drive it in tests.

use crate::member::{Member, MemberUpdate, NodeStatus};
use crate::node_info::NodeInfo;
use dmap_common::NodeId;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use tokio::time::{Duration, Instant};

/// Tunables for the membership state machine.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub probe_interval: Duration,
    pub indirect_checks: usize,
    pub retransmit_mult: usize,
    pub suspicion_mult: u32,
    pub suspicion_max_timeout_mult: u32,
    /// Retention of dead and departed members before they are forgotten.
    pub leave_timeout: Duration,
    pub max_gossip_digest: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            indirect_checks: 3,
            retransmit_mult: 4,
            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,
            leave_timeout: Duration::from_secs(5),
            max_gossip_digest: 32,
        }
    }
}

/// Observable outcome of applying a claim or advancing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeInfo),
    StatusChanged {
        node: NodeInfo,
        from: NodeStatus,
        to: NodeStatus,
    },
    /// The local node contradicted a claim about itself.
    Refuted { incarnation: u64 },
    /// A dead or departed member was forgotten.
    Removed(NodeInfo),
}

impl MembershipEvent {
    /// Whether the set of members taking part in placement changed.
    pub fn changes_placement(&self) -> bool {
        match self {
            MembershipEvent::Joined(_) => true,
            MembershipEvent::StatusChanged { from, to, .. } => from.is_live() != to.is_live(),
            MembershipEvent::Refuted { .. } | MembershipEvent::Removed(_) => false,
        }
    }
}

#[derive(Debug)]
struct Suspicion {
    started: Instant,
    incarnation: u64,
    suspecters: HashSet<NodeId>,
}

#[derive(Debug)]
struct Broadcast {
    update: MemberUpdate,
    transmits: usize,
}

/// Suspicion timeout for a cluster of `cluster_size` live members after
/// `confirmations` independent suspecters beyond the first.
///
/// The base timeout grows with `log10(cluster_size)`. A fresh suspicion
/// starts at `suspicion_max_timeout_mult` times the base and decays toward
/// the base as confirmations arrive.
pub fn suspicion_timeout(
    config: &MembershipConfig,
    cluster_size: usize,
    confirmations: usize,
) -> Duration {
    let scale = (cluster_size.max(1) as f64).log10().max(1.0);
    let min = config
        .probe_interval
        .mul_f64(config.suspicion_mult as f64 * scale);
    let max = min * config.suspicion_max_timeout_mult.max(1);

    let expected = config.indirect_checks.min(cluster_size.saturating_sub(2));
    if expected == 0 {
        return min;
    }
    let frac = ((confirmations as f64 + 1.0).ln() / (expected as f64 + 1.0).ln()).min(1.0);
    let timeout = max.as_secs_f64() - frac * (max - min).as_secs_f64();
    Duration::from_secs_f64(timeout.max(min.as_secs_f64()))
}

/// How many times one update is gossiped before it is dropped.
pub fn retransmit_limit(retransmit_mult: usize, cluster_size: usize) -> usize {
    let scale = ((cluster_size + 1) as f64).log10().ceil() as usize;
    retransmit_mult.max(1) * scale.max(1)
}

/// Local view of the cluster.
pub struct Membership {
    local: NodeInfo,
    incarnation: u64,
    leaving: bool,
    members: HashMap<NodeId, Member>,
    suspicions: HashMap<NodeId, Suspicion>,
    broadcasts: HashMap<NodeId, Broadcast>,
    probe_order: Vec<NodeId>,
    config: MembershipConfig,
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("local", &self.local)
            .field("incarnation", &self.incarnation)
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

impl Membership {
    pub fn new(local: NodeInfo, config: MembershipConfig) -> Self {
        let mut membership = Self {
            local,
            incarnation: 0,
            leaving: false,
            members: HashMap::new(),
            suspicions: HashMap::new(),
            broadcasts: HashMap::new(),
            probe_order: Vec::new(),
            config,
        };
        let own = membership.local_update();
        membership.queue(own);
        membership
    }

    pub fn local(&self) -> &NodeInfo {
        &self.local
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn is_leaving(&self) -> bool {
        self.leaving
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// The claim this node makes about itself.
    pub fn local_update(&self) -> MemberUpdate {
        MemberUpdate {
            node: self.local.clone(),
            status: if self.leaving {
                NodeStatus::Left
            } else {
                NodeStatus::Alive
            },
            incarnation: self.incarnation,
            from: self.local.id,
        }
    }

    /// A remote member, if known.
    pub fn get(&self, id: &NodeId) -> Option<&Member> {
        self.members.get(id)
    }

    /// All remote members, whatever their status.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Members taking part in placement, the local node included unless it
    /// is leaving.
    pub fn live_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self
            .members
            .values()
            .filter(|m| m.status.is_live())
            .map(|m| m.info.clone())
            .collect();
        if !self.leaving {
            nodes.push(self.local.clone());
        }
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    pub fn live_count(&self) -> usize {
        let remote = self.members.values().filter(|m| m.status.is_live()).count();
        remote + usize::from(!self.leaving)
    }

    /// The oldest live member; it distributes the routing table.
    pub fn coordinator(&self) -> Option<NodeInfo> {
        self.live_nodes().into_iter().min_by_key(|n| n.seniority())
    }

    /// Every known claim, the local one included. Sent to joining nodes.
    pub fn full_state(&self) -> Vec<MemberUpdate> {
        let mut state = vec![self.local_update()];
        state.extend(self.members.values().map(|m| m.to_update(self.local.id)));
        state
    }

    // -----------------------------------------------------------------------
    // Claims
    // -----------------------------------------------------------------------

    /// Apply one status claim received through gossip, a probe ack or a join.
    pub fn apply(&mut self, update: MemberUpdate, now: Instant) -> Vec<MembershipEvent> {
        if update.node.id == self.local.id {
            return self.apply_about_self(&update);
        }

        let Some(member) = self.members.get_mut(&update.node.id) else {
            // Only an alive claim introduces a node.
            if update.status != NodeStatus::Alive {
                return vec![];
            }
            let info = update.node.clone();
            self.members.insert(
                info.id,
                Member {
                    info: info.clone(),
                    status: NodeStatus::Alive,
                    incarnation: update.incarnation,
                    changed_at: now,
                },
            );
            self.probe_order.push(info.id);
            self.queue(update);
            return vec![MembershipEvent::Joined(info)];
        };

        let accepted = match update.status {
            NodeStatus::Alive => update.incarnation > member.incarnation,
            NodeStatus::Suspect => match member.status {
                NodeStatus::Alive => update.incarnation >= member.incarnation,
                NodeStatus::Suspect => update.incarnation > member.incarnation,
                NodeStatus::Dead | NodeStatus::Left => false,
            },
            NodeStatus::Dead => {
                !matches!(member.status, NodeStatus::Dead | NodeStatus::Left)
                    && update.incarnation >= member.incarnation
            }
            NodeStatus::Left => {
                member.status != NodeStatus::Left && update.incarnation >= member.incarnation
            }
        };

        if !accepted {
            if update.status == NodeStatus::Suspect
                && member.status == NodeStatus::Suspect
                && update.incarnation == member.incarnation
            {
                if let Some(s) = self.suspicions.get_mut(&update.node.id) {
                    if s.suspecters.insert(update.from) {
                        self.queue(update);
                    }
                }
            }
            return vec![];
        }

        let from = member.status;
        member.status = update.status;
        member.incarnation = update.incarnation;
        if update.status == NodeStatus::Alive {
            member.info = update.node.clone();
        }
        if from != update.status {
            member.changed_at = now;
        }
        let info = member.info.clone();

        if update.status == NodeStatus::Suspect {
            self.suspicions.insert(
                info.id,
                Suspicion {
                    started: now,
                    incarnation: update.incarnation,
                    suspecters: HashSet::from([update.from]),
                },
            );
        } else {
            self.suspicions.remove(&info.id);
        }
        let to = update.status;
        self.queue(update);

        if from == to {
            return vec![];
        }
        vec![MembershipEvent::StatusChanged {
            node: info,
            from,
            to,
        }]
    }

    fn apply_about_self(&mut self, update: &MemberUpdate) -> Vec<MembershipEvent> {
        let contradicts = match update.status {
            NodeStatus::Alive => update.incarnation > self.incarnation,
            NodeStatus::Suspect | NodeStatus::Dead => update.incarnation >= self.incarnation,
            NodeStatus::Left => !self.leaving && update.incarnation >= self.incarnation,
        };
        if !contradicts {
            return vec![];
        }
        self.incarnation = update.incarnation + 1;
        let own = self.local_update();
        self.queue(own);
        vec![MembershipEvent::Refuted {
            incarnation: self.incarnation,
        }]
    }

    /// Record that `target` failed both direct and indirect probes.
    pub fn suspect(&mut self, target: &NodeId, now: Instant) -> Vec<MembershipEvent> {
        let Some(member) = self.members.get(target) else {
            return vec![];
        };
        if !member.status.is_live() {
            return vec![];
        }
        let update = MemberUpdate {
            node: member.info.clone(),
            status: NodeStatus::Suspect,
            incarnation: member.incarnation,
            from: self.local.id,
        };
        self.apply(update, now)
    }

    /// Announce a graceful departure. Returns the claim to deliver to peers.
    pub fn leave(&mut self) -> MemberUpdate {
        self.leaving = true;
        let own = self.local_update();
        self.queue(own.clone());
        own
    }

    // -----------------------------------------------------------------------
    // Time
    // -----------------------------------------------------------------------

    /// Promote expired suspicions to dead and forget members whose
    /// retention elapsed.
    pub fn tick(&mut self, now: Instant) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        let cluster_size = self.live_count();

        let expired: Vec<(NodeId, u64)> = self
            .suspicions
            .iter()
            .filter(|(_, s)| {
                let confirmations = s.suspecters.len().saturating_sub(1);
                now.saturating_duration_since(s.started)
                    >= suspicion_timeout(&self.config, cluster_size, confirmations)
            })
            .map(|(id, s)| (*id, s.incarnation))
            .collect();

        for (id, incarnation) in expired {
            self.suspicions.remove(&id);
            let Some(member) = self.members.get(&id) else {
                continue;
            };
            if member.status != NodeStatus::Suspect || member.incarnation != incarnation {
                continue;
            }
            let update = MemberUpdate {
                node: member.info.clone(),
                status: NodeStatus::Dead,
                incarnation,
                from: self.local.id,
            };
            events.extend(self.apply(update, now));
        }

        let retention = self.config.leave_timeout;
        let reaped: Vec<NodeId> = self
            .members
            .values()
            .filter(|m| {
                !m.status.is_live() && now.saturating_duration_since(m.changed_at) >= retention
            })
            .map(|m| m.info.id)
            .collect();
        for id in reaped {
            if let Some(member) = self.members.remove(&id) {
                self.broadcasts.remove(&id);
                events.push(MembershipEvent::Removed(member.info));
            }
        }

        events
    }

    // -----------------------------------------------------------------------
    // Dissemination and peer selection
    // -----------------------------------------------------------------------

    fn queue(&mut self, update: MemberUpdate) {
        self.broadcasts.insert(
            update.node.id,
            Broadcast {
                update,
                transmits: 0,
            },
        );
    }

    /// Take the next batch of updates to piggyback on an outgoing message.
    ///
    /// Least-transmitted updates go first; an update is dropped once it has
    /// been sent `retransmit_limit` times.
    pub fn digest(&mut self) -> Vec<MemberUpdate> {
        let limit = retransmit_limit(self.config.retransmit_mult, self.live_count());
        let mut order: Vec<(usize, NodeId)> = self
            .broadcasts
            .iter()
            .map(|(id, b)| (b.transmits, *id))
            .collect();
        order.sort();
        order.truncate(self.config.max_gossip_digest);

        let mut out = Vec::with_capacity(order.len());
        for (_, id) in order {
            let Some(b) = self.broadcasts.get_mut(&id) else {
                continue;
            };
            b.transmits += 1;
            out.push(b.update.clone());
            if b.transmits >= limit {
                self.broadcasts.remove(&id);
            }
        }
        out
    }

    pub fn pending_broadcasts(&self) -> usize {
        self.broadcasts.len()
    }

    /// Next member to probe. Cycles through live members in a shuffled
    /// order, reshuffling after each full round.
    pub fn next_probe_target(&mut self) -> Option<NodeInfo> {
        for _ in 0..2 {
            while let Some(id) = self.probe_order.pop() {
                if let Some(m) = self.members.get(&id).filter(|m| m.status.is_live()) {
                    return Some(m.info.clone());
                }
            }
            self.probe_order = self
                .members
                .values()
                .filter(|m| m.status.is_live())
                .map(|m| m.info.id)
                .collect();
            self.probe_order.shuffle(&mut rand::thread_rng());
            if self.probe_order.is_empty() {
                return None;
            }
        }
        None
    }

    /// Up to `k` random live members, skipping `exclude`.
    pub fn random_peers(&self, k: usize, exclude: &[NodeId]) -> Vec<NodeInfo> {
        let mut peers: Vec<NodeInfo> = self
            .members
            .values()
            .filter(|m| m.status.is_live() && !exclude.contains(&m.info.id))
            .map(|m| m.info.clone())
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(k);
        peers
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
