//! In-process gossip network.
//!
//! Every [`ClusterService`] registered on a [`LocalNetwork`] is reachable
//! by node id; requests are dispatched straight to its `handle_request`.
//! Used by the embedded node and by tests.

use crate::node_info::NodeInfo;
use crate::rpc::{GossipRequest, GossipResponse, GossipTransport};
use crate::ClusterService;
use dmap_common::{ClusterError, NodeId};
use futures::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type GossipHandler = Arc<
    dyn Fn(GossipRequest) -> BoxFuture<'static, Result<GossipResponse, ClusterError>>
        + Send
        + Sync,
>;

/// Shared registry of gossip handlers keyed by node id.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<RwLock<HashMap<NodeId, GossipHandler>>>,
    /// Directed (from, to) links that drop traffic.
    blocked: Arc<RwLock<HashSet<(NodeId, NodeId)>>>,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork").finish_non_exhaustive()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `service` reachable. The registry holds a weak reference, so a
    /// dropped service simply stops answering.
    pub async fn register<T: GossipTransport>(&self, service: &Arc<ClusterService<T>>) {
        let weak = Arc::downgrade(service);
        let handler: GossipHandler = Arc::new(move |request| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(service) => Ok(service.handle_request(request).await),
                    None => Err(ClusterError::ShuttingDown),
                }
            }
            .boxed()
        });
        self.registry
            .write()
            .await
            .insert(service.local_info().id, handler);
    }

    /// Register an arbitrary handler, e.g. a scripted peer in tests.
    pub async fn register_handler(&self, id: NodeId, handler: GossipHandler) {
        self.registry.write().await.insert(id, handler);
    }

    pub async fn unregister(&self, id: &NodeId) {
        self.registry.write().await.remove(id);
    }

    /// Drop all traffic sent by `from` to `to`.
    pub async fn block_link(&self, from: NodeId, to: NodeId) {
        self.blocked.write().await.insert((from, to));
    }

    pub async fn heal(&self) {
        self.blocked.write().await.clear();
    }
}

#[async_trait::async_trait]
impl GossipTransport for LocalNetwork {
    async fn send_request(
        &self,
        target: &NodeInfo,
        request: GossipRequest,
    ) -> Result<GossipResponse, ClusterError> {
        if self
            .blocked
            .read()
            .await
            .contains(&(request.sender().id, target.id))
        {
            return Err(ClusterError::Unreachable(target.addr.to_string()));
        }
        let handler = self
            .registry
            .read()
            .await
            .get(&target.id)
            .cloned()
            .ok_or(ClusterError::NodeNotFound(target.id))?;
        handler(request).await
    }
}
