//! In-process replica network.
//!
//! Every [`Coordinator`] registered on a [`LocalReplicaNetwork`] is reachable
//! by node id; data requests are dispatched straight to its
//! `handle_request`. Used by the embedded node and by tests.

use crate::coordinator::Coordinator;
use crate::replica_client::{ReplicaClient, ReplicaError, ReplicaRequest, ReplicaResponse};
use dmap_cluster::node_info::NodeInfo;
use dmap_common::NodeId;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type ReplicaHandler = Arc<
    dyn Fn(ReplicaRequest) -> BoxFuture<'static, Result<ReplicaResponse, ReplicaError>>
        + Send
        + Sync,
>;

/// Shared registry of replica handlers keyed by node id.
#[derive(Clone, Default)]
pub struct LocalReplicaNetwork {
    registry: Arc<RwLock<HashMap<NodeId, ReplicaHandler>>>,
}

impl std::fmt::Debug for LocalReplicaNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalReplicaNetwork").finish_non_exhaustive()
    }
}

impl LocalReplicaNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `coordinator` reachable. Only a weak reference is kept.
    pub async fn register<R: ReplicaClient>(&self, coordinator: &Arc<Coordinator<R>>) {
        let weak = Arc::downgrade(coordinator);
        let handler: ReplicaHandler = Arc::new(move |request| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(coordinator) => coordinator.handle_request(request).await,
                    None => Err(ReplicaError::RpcFailed("node is gone".into())),
                }
            }
            .boxed()
        });
        self.registry
            .write()
            .await
            .insert(coordinator.local().id, handler);
    }

    pub async fn register_handler(&self, id: NodeId, handler: ReplicaHandler) {
        self.registry.write().await.insert(id, handler);
    }

    pub async fn unregister(&self, id: &NodeId) {
        self.registry.write().await.remove(id);
    }
}

#[async_trait::async_trait]
impl ReplicaClient for LocalReplicaNetwork {
    async fn send(
        &self,
        target: &NodeInfo,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, ReplicaError> {
        let handler = self
            .registry
            .read()
            .await
            .get(&target.id)
            .cloned()
            .ok_or_else(|| ReplicaError::RpcFailed(format!("no route to {}", target)))?;
        handler(request).await
    }
}
