//! dmap-node: entry point for an embedded map node.
//!
//! Loads config, initialises tracing and the optional metrics endpoint,
//! wires membership, storage and the map coordinator over the in-process
//! transports, then runs until Ctrl+C and leaves the cluster gracefully.

use dmap_cluster::local::LocalNetwork;
use dmap_kv::{LocalReplicaNetwork, Node};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{Duration, Instant, MissedTickBehavior};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = dmap_config::load_from_file(std::path::Path::new(&config_path))?;

    dmap_metrics::init_tracing(&config.logging.level);
    tracing::info!(
        config = %config_path,
        bind = %config.memberlist.bind_addr,
        partitions = config.server.partition_count,
        replicas = config.server.replica_count,
        "starting node"
    );

    // Spawn metrics HTTP server if configured
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = dmap_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    let leave_timeout = Duration::from_millis(config.server.leave_timeout_ms);
    let gossip = LocalNetwork::new();
    let replicas = LocalReplicaNetwork::new();
    let node = Arc::new(Node::new(config, gossip.clone(), replicas.clone()));
    gossip.register(node.cluster()).await;
    replicas.register(node.coordinator()).await;
    node.start().await;

    // Periodic diagnostics until Ctrl+C
    let mut report = tokio::time::interval(Duration::from_secs(30));
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = report.tick() => {
                let stats = node.stats().await;
                tracing::info!(
                    members = stats.members.len(),
                    table_version = stats.routing_table_version,
                    primaries = stats.primary_partitions.len(),
                    backups = stats.backup_partitions.len(),
                    keys = stats.keys,
                    inuse_bytes = stats.inuse_bytes,
                    locks = stats.locks,
                    "node stats"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C, shutting down");
                break;
            }
        }
    }

    node.shutdown(Instant::now() + leave_timeout).await;
    Ok(())
}
