//! Configuration schema and loader for dmap nodes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster-wide placement and replication settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Membership and failure-detector settings.
    pub memberlist: MemberlistConfig,

    /// Storage and eviction settings for distributed maps.
    #[serde(default)]
    pub dmaps: DMapsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Wait for the write quorum before acknowledging.
    Sync,
    /// Acknowledge after the primary, replicate to backups in the background.
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Number of partitions. Fixed for the lifetime of a cluster.
    #[serde(default = "default_partition_count")]
    pub partition_count: u64,

    /// Owners per partition (primary + backups).
    #[serde(default = "default_replica_count")]
    pub replica_count: usize,

    #[serde(default = "default_replication_mode")]
    pub replication_mode: ReplicationMode,

    /// Acknowledgements (primary included) required for a write.
    #[serde(default = "default_one")]
    pub write_quorum: usize,

    /// Responses required for a read.
    #[serde(default = "default_one")]
    pub read_quorum: usize,

    /// Whether reads push the winning version to stale owners.
    #[serde(default)]
    pub read_repair: bool,

    /// Minimum number of known members before the node serves operations.
    #[serde(default = "default_one")]
    pub member_count_quorum: usize,

    #[serde(default = "default_routing_table_push_interval_ms")]
    pub routing_table_push_interval_ms: u64,

    #[serde(default = "default_trigger_balancer_interval_ms")]
    pub trigger_balancer_interval_ms: u64,

    /// How long dead or departed members are retained before being purged.
    #[serde(default = "default_leave_timeout_ms")]
    pub leave_timeout_ms: u64,

    /// Upper bound on a single client operation, fan-out included.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Retry budget for transient replica failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_min_ms")]
    pub retry_backoff_min_ms: u64,

    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// How often expired lock records are reclaimed.
    #[serde(default = "default_lock_reap_interval_ms")]
    pub lock_reap_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            partition_count: default_partition_count(),
            replica_count: default_replica_count(),
            replication_mode: default_replication_mode(),
            write_quorum: 1,
            read_quorum: 1,
            read_repair: false,
            member_count_quorum: 1,
            routing_table_push_interval_ms: default_routing_table_push_interval_ms(),
            trigger_balancer_interval_ms: default_trigger_balancer_interval_ms(),
            leave_timeout_ms: default_leave_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_min_ms: default_retry_backoff_min_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            lock_reap_interval_ms: default_lock_reap_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberlistConfig {
    /// This node's address; also the source of its node id.
    pub bind_addr: SocketAddr,

    /// Addresses contacted on join.
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// Peers contacted per gossip round.
    #[serde(default = "default_gossip_nodes")]
    pub gossip_nodes: usize,

    /// Peers asked to probe a target on our behalf after a direct probe fails.
    #[serde(default = "default_indirect_checks")]
    pub indirect_checks: usize,

    #[serde(default = "default_retransmit_mult")]
    pub retransmit_mult: usize,

    #[serde(default = "default_suspicion_mult")]
    pub suspicion_mult: u32,

    #[serde(default = "default_suspicion_max_timeout_mult")]
    pub suspicion_max_timeout_mult: u32,

    /// Upper bound on updates carried by one gossip message.
    #[serde(default = "default_max_gossip_digest")]
    pub max_gossip_digest: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyName {
    None,
    Ttl,
    Lru,
}

/// Per-map overrides. Unset fields fall back to the global `dmaps` values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DMapOverrides {
    #[serde(default)]
    pub max_idle_duration_ms: Option<u64>,
    #[serde(default)]
    pub ttl_duration_ms: Option<u64>,
    #[serde(default)]
    pub max_keys: Option<usize>,
    #[serde(default)]
    pub max_inuse: Option<usize>,
    #[serde(default)]
    pub lru_samples: Option<usize>,
    #[serde(default)]
    pub eviction_policy: Option<EvictionPolicyName>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DMapsConfig {
    #[serde(default = "default_num_eviction_workers")]
    pub num_eviction_workers: usize,

    #[serde(default = "default_eviction_interval_ms")]
    pub eviction_interval_ms: u64,

    /// 0 disables idle eviction.
    #[serde(default)]
    pub max_idle_duration_ms: u64,

    /// 0 means entries written without an explicit TTL never expire.
    #[serde(default)]
    pub ttl_duration_ms: u64,

    /// 0 means unbounded.
    #[serde(default)]
    pub max_keys: usize,

    /// Approximate byte budget per fragment; 0 means unbounded.
    #[serde(default)]
    pub max_inuse: usize,

    #[serde(default = "default_lru_samples")]
    pub lru_samples: usize,

    #[serde(default = "default_eviction_policy")]
    pub eviction_policy: EvictionPolicyName,

    #[serde(default)]
    pub custom: HashMap<String, DMapOverrides>,
}

impl Default for DMapsConfig {
    fn default() -> Self {
        Self {
            num_eviction_workers: default_num_eviction_workers(),
            eviction_interval_ms: default_eviction_interval_ms(),
            max_idle_duration_ms: 0,
            ttl_duration_ms: 0,
            max_keys: 0,
            max_inuse: 0,
            lru_samples: default_lru_samples(),
            eviction_policy: default_eviction_policy(),
            custom: HashMap::new(),
        }
    }
}

/// Eviction settings for one map after applying its overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDMapConfig {
    pub max_idle_duration_ms: u64,
    pub ttl_duration_ms: u64,
    pub max_keys: usize,
    pub max_inuse: usize,
    pub lru_samples: usize,
    pub eviction_policy: EvictionPolicyName,
}

impl DMapsConfig {
    /// Resolve the effective settings of map `name`.
    pub fn resolve(&self, name: &str) -> ResolvedDMapConfig {
        let custom = self.custom.get(name).cloned().unwrap_or_default();
        ResolvedDMapConfig {
            max_idle_duration_ms: custom
                .max_idle_duration_ms
                .unwrap_or(self.max_idle_duration_ms),
            ttl_duration_ms: custom.ttl_duration_ms.unwrap_or(self.ttl_duration_ms),
            max_keys: custom.max_keys.unwrap_or(self.max_keys),
            max_inuse: custom.max_inuse.unwrap_or(self.max_inuse),
            lru_samples: custom.lru_samples.unwrap_or(self.lru_samples),
            eviction_policy: custom.eviction_policy.unwrap_or(self.eviction_policy),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// --- Defaults ---

fn default_partition_count() -> u64 {
    271
}
fn default_replica_count() -> usize {
    1
}
fn default_replication_mode() -> ReplicationMode {
    ReplicationMode::Sync
}
fn default_one() -> usize {
    1
}
fn default_routing_table_push_interval_ms() -> u64 {
    60_000
}
fn default_trigger_balancer_interval_ms() -> u64 {
    15_000
}
fn default_leave_timeout_ms() -> u64 {
    5_000
}
fn default_operation_timeout_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_min_ms() -> u64 {
    8
}
fn default_retry_backoff_max_ms() -> u64 {
    512
}
fn default_lock_reap_interval_ms() -> u64 {
    1_000
}
fn default_probe_interval_ms() -> u64 {
    1_000
}
fn default_probe_timeout_ms() -> u64 {
    500
}
fn default_gossip_interval_ms() -> u64 {
    200
}
fn default_gossip_nodes() -> usize {
    3
}
fn default_indirect_checks() -> usize {
    3
}
fn default_retransmit_mult() -> usize {
    4
}
fn default_suspicion_mult() -> u32 {
    4
}
fn default_suspicion_max_timeout_mult() -> u32 {
    6
}
fn default_max_gossip_digest() -> usize {
    32
}
fn default_num_eviction_workers() -> usize {
    1
}
fn default_eviction_interval_ms() -> u64 {
    100
}
fn default_lru_samples() -> usize {
    5
}
fn default_eviction_policy() -> EvictionPolicyName {
    EvictionPolicyName::None
}
fn default_log_level() -> String {
    "info".to_string()
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.server;
        if s.partition_count == 0 {
            return Err(ConfigError::Invalid(
                "server.partition_count must be > 0".into(),
            ));
        }
        if s.replica_count == 0 {
            return Err(ConfigError::Invalid(
                "server.replica_count must be > 0".into(),
            ));
        }
        if s.read_quorum == 0 || s.read_quorum > s.replica_count {
            return Err(ConfigError::Invalid(format!(
                "server.read_quorum ({}) must be in 1..={}",
                s.read_quorum, s.replica_count
            )));
        }
        if s.write_quorum == 0 || s.write_quorum > s.replica_count {
            return Err(ConfigError::Invalid(format!(
                "server.write_quorum ({}) must be in 1..={}",
                s.write_quorum, s.replica_count
            )));
        }
        if s.member_count_quorum == 0 {
            return Err(ConfigError::Invalid(
                "server.member_count_quorum must be > 0".into(),
            ));
        }
        if s.retry_backoff_min_ms > s.retry_backoff_max_ms {
            return Err(ConfigError::Invalid(
                "server.retry_backoff_min_ms must be <= retry_backoff_max_ms".into(),
            ));
        }
        if self.memberlist.probe_timeout_ms > self.memberlist.probe_interval_ms {
            return Err(ConfigError::Invalid(
                "memberlist.probe_timeout_ms must be <= probe_interval_ms".into(),
            ));
        }
        if self.dmaps.num_eviction_workers == 0 {
            return Err(ConfigError::Invalid(
                "dmaps.num_eviction_workers must be > 0".into(),
            ));
        }
        let mut names: Vec<&str> = vec![""];
        names.extend(self.dmaps.custom.keys().map(String::as_str));
        for name in names {
            let resolved = self.dmaps.resolve(name);
            if resolved.eviction_policy == EvictionPolicyName::Lru && resolved.lru_samples == 0 {
                return Err(ConfigError::Invalid(format!(
                    "dmaps lru_samples must be > 0 when eviction_policy is lru (map '{}')",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
