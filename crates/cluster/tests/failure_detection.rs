//! Multi-node membership tests over the in-process network.
//!
//! Nodes run their real background loops; failures are injected through
//! the chaos wrapper or by removing a node from the network.

use dmap_cluster::chaos::{ChaosConfig, ChaosTransport};
use dmap_cluster::local::LocalNetwork;
use dmap_cluster::member::{MemberUpdate, NodeStatus};
use dmap_cluster::node_info::NodeInfo;
use dmap_cluster::rpc::GossipRequest;
use dmap_cluster::{ClusterConfig, ClusterService};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

type Service = ClusterService<ChaosTransport<LocalNetwork>>;

// ────────────────────────── TestCluster ──────────────────────────

struct TestCluster {
    network: LocalNetwork,
    nodes: Vec<Arc<Service>>,
    chaos: Vec<ChaosTransport<LocalNetwork>>,
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn fast_config() -> ClusterConfig {
    ClusterConfig {
        partition_count: 23,
        replica_count: 2,
        probe_interval: Duration::from_millis(30),
        probe_timeout: Duration::from_millis(10),
        gossip_interval: Duration::from_millis(10),
        suspicion_mult: 2,
        suspicion_max_timeout_mult: 3,
        leave_timeout: Duration::from_millis(300),
        push_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

impl TestCluster {
    async fn start(base_port: u16, n: u16) -> Self {
        let network = LocalNetwork::new();
        let mut nodes = Vec::new();
        let mut chaos = Vec::new();
        for i in 0..n {
            let info = NodeInfo::with_birthdate(addr(base_port + i), 1_000 + i as u64);
            let transport = ChaosTransport::new(network.clone(), ChaosConfig::default());
            chaos.push(transport.clone());
            let service = Arc::new(ClusterService::new(info, transport, fast_config()));
            network.register(&service).await;
            nodes.push(service);
        }
        for node in &nodes[1..] {
            node.join(&[addr(base_port)]).await.unwrap();
        }
        for node in &nodes {
            node.start().await;
        }
        Self {
            network,
            nodes,
            chaos,
        }
    }

    async fn status_of(&self, observer: usize, subject: usize) -> Option<NodeStatus> {
        let id = self.nodes[subject].local_info().id;
        self.nodes[observer]
            .view()
            .snapshot()
            .await
            .into_iter()
            .find(|m| m.info.id == id)
            .map(|m| m.status)
    }

    async fn stop(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }
}

async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

// ────────────────────────── Tests ──────────────────────────

#[tokio::test]
async fn test_all_nodes_converge_on_one_table() {
    let cluster = TestCluster::start(9100, 4).await;

    let c = &cluster;
    let converged = eventually(Duration::from_secs(3), || async move {
        let reference = c.nodes[0].view().routing_table();
        let mut ok = reference.members().len() == 4;
        for node in &c.nodes[1..] {
            ok &= node.view().routing_table().same_assignment(&reference);
        }
        ok
    })
    .await;
    assert!(converged, "routing tables did not converge");
    cluster.stop().await;
}

#[tokio::test]
async fn test_crashed_node_is_declared_dead_and_removed() {
    let cluster = TestCluster::start(9110, 4).await;
    let victim = 3;
    let victim_id = cluster.nodes[victim].local_info().id;

    cluster.nodes[victim].stop().await;
    cluster.network.unregister(&victim_id).await;

    let c = &cluster;
    let dead = eventually(Duration::from_secs(5), || async move {
        for observer in 0..3 {
            match c.status_of(observer, victim).await {
                Some(NodeStatus::Dead) | None => {}
                _ => return false,
            }
        }
        true
    })
    .await;
    assert!(dead, "crashed node was not declared dead");

    for observer in 0..3 {
        let table = cluster.nodes[observer].view().routing_table();
        assert!(table.members().iter().all(|m| m.id != victim_id));
    }

    let removed = eventually(Duration::from_secs(5), || async move {
        for observer in 0..3 {
            if c.status_of(observer, victim).await.is_some() {
                return false;
            }
        }
        true
    })
    .await;
    assert!(removed, "dead node was not reaped after the retention timeout");

    for node in &cluster.nodes[..3] {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_false_suspicion_is_refuted() {
    let cluster = TestCluster::start(9120, 3).await;
    let subject = cluster.nodes[2].local_info().clone();

    // Node 0 gossips a suspicion about a perfectly healthy node.
    let accusation = MemberUpdate {
        node: subject.clone(),
        status: NodeStatus::Suspect,
        incarnation: 0,
        from: cluster.nodes[0].local_info().id,
    };
    for node in &cluster.nodes {
        node.handle_request(GossipRequest::Gossip {
            sender: cluster.nodes[0].local_info().clone(),
            updates: vec![accusation.clone()],
        })
        .await;
    }

    let c = &cluster;
    let refuted = eventually(Duration::from_secs(3), || async move {
        for observer in 0..2 {
            if c.status_of(observer, 2).await != Some(NodeStatus::Alive) {
                return false;
            }
        }
        true
    })
    .await;
    assert!(refuted, "suspicion about a live node was not refuted");

    let snapshot = cluster.nodes[2].view().snapshot().await;
    assert!(snapshot[0].incarnation >= 1, "refutation bumps the incarnation");
    cluster.stop().await;
}

#[tokio::test]
async fn test_indirect_probes_prevent_false_positive() {
    let cluster = TestCluster::start(9130, 4).await;
    let a = cluster.nodes[0].local_info().id;
    let b = cluster.nodes[1].local_info().id;

    // Only the direct path from node 0 to node 1 is broken.
    cluster.chaos[0].add_partition(a, b).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(cluster.status_of(0, 1).await, Some(NodeStatus::Alive));
    cluster.chaos[0].heal_all().await;
    cluster.stop().await;
}

#[tokio::test]
async fn test_graceful_leave_updates_everyone() {
    let cluster = TestCluster::start(9140, 3).await;
    cluster.nodes[2].leave().await;
    cluster.nodes[2].stop().await;

    for observer in 0..2 {
        let status = cluster.status_of(observer, 2).await;
        assert!(
            matches!(status, Some(NodeStatus::Left) | None),
            "observer {} sees {:?}",
            observer,
            status
        );
        let table = cluster.nodes[observer].view().routing_table();
        assert_eq!(table.members().len(), 2);
    }
    for node in &cluster.nodes[..2] {
        node.stop().await;
    }
}
