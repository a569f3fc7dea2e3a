//! Chaos injection for membership traffic.
//!
//! [`ChaosTransport`] wraps any [`GossipTransport`] and injects configurable
//! failures: random errors, latency, failed nodes and one-way partitions.
//! Clones share their fault state, so a test can keep a handle after
//! moving the transport into a service.

use crate::node_info::NodeInfo;
use crate::rpc::{GossipRequest, GossipResponse, GossipTransport};
use dmap_common::{ClusterError, NodeId};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

pub struct ChaosTransport<T: GossipTransport> {
    inner: Arc<T>,
    config: Arc<RwLock<ChaosConfig>>,
    failed_nodes: Arc<RwLock<HashSet<NodeId>>>,
    /// Set of (from, to) pairs that are partitioned.
    partitions: Arc<RwLock<HashSet<(NodeId, NodeId)>>>,
}

impl<T: GossipTransport> Clone for ChaosTransport<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
            failed_nodes: self.failed_nodes.clone(),
            partitions: self.partitions.clone(),
        }
    }
}

impl<T: GossipTransport> std::fmt::Debug for ChaosTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosTransport").finish_non_exhaustive()
    }
}

impl<T: GossipTransport> ChaosTransport<T> {
    pub fn new(inner: T, config: ChaosConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config: Arc::new(RwLock::new(config)),
            failed_nodes: Arc::new(RwLock::new(HashSet::new())),
            partitions: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.config.write().await.latency = latency;
    }

    /// Every request to `node` fails until it is recovered.
    pub async fn fail_node(&self, node: NodeId) {
        self.failed_nodes.write().await.insert(node);
    }

    pub async fn recover_node(&self, node: NodeId) {
        self.failed_nodes.write().await.remove(&node);
    }

    /// Block all requests from `from` to `to`.
    pub async fn add_partition(&self, from: NodeId, to: NodeId) {
        self.partitions.write().await.insert((from, to));
    }

    pub async fn heal_all(&self) {
        self.partitions.write().await.clear();
        self.failed_nodes.write().await.clear();
    }
}

#[async_trait::async_trait]
impl<T: GossipTransport> GossipTransport for ChaosTransport<T> {
    async fn send_request(
        &self,
        target: &NodeInfo,
        request: GossipRequest,
    ) -> Result<GossipResponse, ClusterError> {
        if self.failed_nodes.read().await.contains(&target.id) {
            return Err(ClusterError::Unreachable(format!("chaos: {} is down", target)));
        }
        if self
            .partitions
            .read()
            .await
            .contains(&(request.sender().id, target.id))
        {
            return Err(ClusterError::Unreachable("chaos: partitioned".into()));
        }

        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            (
                config.latency + Duration::from_millis(jitter_ms),
                config.failure_rate,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(ClusterError::Internal("chaos: random failure".into()));
        }

        self.inner.send_request(target, request).await
    }
}

// ────────────────────────── Tests ──────────────────────────
