//! Metrics and tracing setup for dmap nodes.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
///
/// `RUST_LOG` wins over `default_level` when set.
pub fn init_tracing(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .try_init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a dmap node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Client-facing operations ──
    pub ops: IntCounterVec,
    pub op_latency_secs: HistogramVec,

    // ── RPCs ──
    pub rpcs_sent_by_type: IntCounterVec,

    // ── Replication ──
    pub read_repairs: IntCounter,
    pub degraded_writes: IntCounter,

    // ── Storage ──
    pub evictions: IntCounterVec,

    // ── Cluster ──
    pub migrations: IntCounterVec,
    pub member_transitions: IntCounterVec,
    pub routing_table_version: IntGauge,

    // ── Locks ──
    pub lock_conflicts: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for operation latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts")
}

fn counter_vec(name: &str, help: &str, label: &str) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), &[label]).expect("valid counter vec opts")
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let ops = counter_vec("dmap_ops_total", "Client operations, by op", "op");
        let op_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "dmap_op_latency_seconds",
                "Client operation latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["op"],
        )
        .expect("op_latency_secs histogram");

        let rpcs_sent_by_type = counter_vec(
            "dmap_rpcs_sent_by_type_total",
            "Outbound RPCs sent, by type",
            "rpc_type",
        );

        let read_repairs = counter(
            "dmap_read_repairs_total",
            "Read repair writes pushed to stale owners",
        );
        let degraded_writes = counter(
            "dmap_degraded_writes_total",
            "Async writes that could not reach every backup",
        );

        let evictions = counter_vec(
            "dmap_evictions_total",
            "Entries removed by the eviction engine, by reason",
            "reason",
        );

        let migrations = counter_vec(
            "dmap_migrations_total",
            "Partition fragment migrations, by outcome",
            "outcome",
        );
        let member_transitions = counter_vec(
            "dmap_member_transitions_total",
            "Membership status transitions observed, by new status",
            "status",
        );
        let routing_table_version = IntGauge::with_opts(Opts::new(
            "dmap_routing_table_version",
            "Version of the routing table currently in use",
        ))
        .expect("routing_table_version gauge");

        let lock_conflicts = counter(
            "dmap_lock_conflicts_total",
            "Lock acquisitions that found the key already held",
        );

        registry
            .register(Box::new(ops.clone()))
            .expect("register ops");
        registry
            .register(Box::new(op_latency_secs.clone()))
            .expect("register op_latency_secs");
        registry
            .register(Box::new(rpcs_sent_by_type.clone()))
            .expect("register rpcs_sent_by_type");
        registry
            .register(Box::new(read_repairs.clone()))
            .expect("register read_repairs");
        registry
            .register(Box::new(degraded_writes.clone()))
            .expect("register degraded_writes");
        registry
            .register(Box::new(evictions.clone()))
            .expect("register evictions");
        registry
            .register(Box::new(migrations.clone()))
            .expect("register migrations");
        registry
            .register(Box::new(member_transitions.clone()))
            .expect("register member_transitions");
        registry
            .register(Box::new(routing_table_version.clone()))
            .expect("register routing_table_version");
        registry
            .register(Box::new(lock_conflicts.clone()))
            .expect("register lock_conflicts");

        Self {
            registry,
            ops,
            op_latency_secs,
            rpcs_sent_by_type,
            read_repairs,
            degraded_writes,
            evictions,
            migrations,
            member_transitions,
            routing_table_version,
            lock_conflicts,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&m.registry.gather(), &mut buf) {
        tracing::warn!("prometheus text encoding failed: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Helper: count an operation and start its latency timer. The returned
/// guard records elapsed time on drop.
pub fn start_op_timer(op: &str) -> prometheus::HistogramTimer {
    let m = metrics();
    m.ops.with_label_values(&[op]).inc();
    m.op_latency_secs.with_label_values(&[op]).start_timer()
}

/// Helper: count one outbound RPC.
pub fn record_rpc(rpc_type: &str) {
    metrics()
        .rpcs_sent_by_type
        .with_label_values(&[rpc_type])
        .inc();
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    if req.uri().path() != "/metrics" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()));
    }
    let body = encode_metrics();
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
