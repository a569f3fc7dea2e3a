//! Chaos injection for data traffic.
//!
//! [`ChaosReplicaClient`] wraps any [`ReplicaClient`] and injects random
//! errors, latency and failed nodes. Clones share their fault state, so a
//! test can keep a handle after moving the client into a node.

use crate::replica_client::{ReplicaClient, ReplicaError, ReplicaRequest, ReplicaResponse};
use dmap_cluster::chaos::ChaosConfig;
use dmap_cluster::node_info::NodeInfo;
use dmap_common::NodeId;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

pub struct ChaosReplicaClient<R: ReplicaClient> {
    inner: Arc<R>,
    config: Arc<RwLock<ChaosConfig>>,
    failed_nodes: Arc<RwLock<HashSet<NodeId>>>,
}

impl<R: ReplicaClient> Clone for ChaosReplicaClient<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
            failed_nodes: self.failed_nodes.clone(),
        }
    }
}

impl<R: ReplicaClient> std::fmt::Debug for ChaosReplicaClient<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosReplicaClient").finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> ChaosReplicaClient<R> {
    pub fn new(inner: R, config: ChaosConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config: Arc::new(RwLock::new(config)),
            failed_nodes: Arc::new(RwLock::new(HashSet::new())),
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

    pub async fn heal_all(&self) {
        self.failed_nodes.write().await.clear();
        let mut config = self.config.write().await;
        config.failure_rate = 0.0;
    }
}

#[async_trait::async_trait]
impl<R: ReplicaClient> ReplicaClient for ChaosReplicaClient<R> {
    async fn send(
        &self,
        target: &NodeInfo,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, ReplicaError> {
        if self.failed_nodes.read().await.contains(&target.id) {
            return Err(ReplicaError::RpcFailed(format!("chaos: {} is down", target)));
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
            return Err(ReplicaError::RpcFailed("chaos: random failure".into()));
        }

        self.inner.send(target, request).await
    }
}

// ────────────────────────── Tests ──────────────────────────
