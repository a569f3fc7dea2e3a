//! Map coordinator: runs operations against the owners of a partition.
//!
//! The coordinator:
//! 1. Maps a key to its partition and owner list (via the routing table)
//! 2. Sends writes and atomic updates to the primary, which assigns the
//!    version and replicates to backups
//! 3. Waits for W acks (sync mode) or replicates in the background (async)
//! 4. Reads from the owners in parallel, keeps the newest version after R
//!    responses, and optionally repairs stale owners
//! 5. Retries once after a table refresh when an owner reports that our
//!    routing table is stale
//!
//! The same type serves incoming requests from peers via
//! [`Coordinator::handle_request`].

use crate::error::KvError;
use crate::lock::{InternalLockGuard, LockError, LockManager, LockToken};
use crate::replica_client::{PrimaryOp, ReplicaClient, ReplicaError, ReplicaRequest, ReplicaResponse};
use dmap_cluster::node_info::NodeInfo;
use dmap_cluster::routing::RoutingTable;
use dmap_cluster::ClusterView;
use dmap_common::PartitionId;
use dmap_config::{ReplicationMode, ServerConfig};
use dmap_storage::{Entry, StorageEngine};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::Rng;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// First wait between attempts to take an internal lock.
const LOCK_RETRY_MIN: Duration = Duration::from_millis(1);
/// Cap on the wait between attempts to take an internal lock.
const LOCK_RETRY_MAX: Duration = Duration::from_millis(16);

/// Quorum and replication configuration.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    pub replication_mode: ReplicationMode,
    /// Acks (primary included) required for a write in sync mode.
    pub write_quorum: usize,
    /// Responses required for a read.
    pub read_quorum: usize,
    pub read_repair: bool,
    /// Known live members required before any operation is served.
    pub member_count_quorum: usize,
    pub operation_timeout: Duration,
    pub max_retries: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for QuorumConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            replication_mode: server.replication_mode,
            write_quorum: server.write_quorum,
            read_quorum: server.read_quorum,
            read_repair: server.read_repair,
            member_count_quorum: server.member_count_quorum,
            operation_timeout: Duration::from_millis(server.operation_timeout_ms),
            max_retries: server.max_retries,
            backoff_min: Duration::from_millis(server.retry_backoff_min_ms),
            backoff_max: Duration::from_millis(server.retry_backoff_max_ms),
        }
    }
}

impl QuorumConfig {
    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            min: self.backoff_min,
            max: self.backoff_max,
        }
    }
}

/// Bounded exponential backoff for transient transport failures.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub min: Duration,
    pub max: Duration,
}

/// Send `request`, retrying transient failures with backoff until the
/// retry budget or the deadline runs out.
pub(crate) async fn send_with_retry<R: ReplicaClient + ?Sized>(
    client: &R,
    target: &NodeInfo,
    request: ReplicaRequest,
    policy: RetryPolicy,
    deadline: Instant,
) -> Result<ReplicaResponse, ReplicaError> {
    let mut backoff = policy.min;
    let mut attempt = 0;
    loop {
        dmap_metrics::record_rpc(request.kind());
        let result = match tokio::time::timeout_at(deadline, client.send(target, request.clone())).await
        {
            Ok(result) => result,
            Err(_) => return Err(ReplicaError::Timeout),
        };
        match result {
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                if Instant::now() + backoff >= deadline {
                    return Err(e);
                }
                tracing::debug!(peer = %target, attempt, "retrying after: {}", e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Outcome of a single attempt that may need a table refresh.
enum Attempt<T> {
    Done(Result<T, KvError>),
    Stale(Box<RoutingTable>),
}

/// How the primary holds a key while it changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyLock {
    /// Read-modify-write: waits out every holder, client locks included.
    Update,
    /// Plain write: waits for other writes and updates only.
    Write,
}

/// A change the primary pushes to its backups.
#[derive(Debug, Clone)]
enum Replication {
    Write(Entry),
    Remove(String),
}

impl Replication {
    fn request(&self, table_version: u64, partition: PartitionId, dmap: &str) -> ReplicaRequest {
        match self {
            Replication::Write(entry) => ReplicaRequest::Write {
                table_version,
                partition,
                dmap: dmap.to_string(),
                entry: entry.clone(),
            },
            Replication::Remove(key) => ReplicaRequest::Remove {
                table_version,
                partition,
                dmap: dmap.to_string(),
                key: key.clone(),
            },
        }
    }
}

/// Distributed map coordinator.
///
/// Generic over `R: ReplicaClient` for testability.
pub struct Coordinator<R: ReplicaClient> {
    view: Arc<ClusterView>,
    storage: Arc<StorageEngine>,
    locks: Arc<LockManager>,
    client: Arc<R>,
    config: QuorumConfig,
}

impl<R: ReplicaClient> std::fmt::Debug for Coordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("local", self.view.local())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> Coordinator<R> {
    pub fn new(
        view: Arc<ClusterView>,
        storage: Arc<StorageEngine>,
        locks: Arc<LockManager>,
        client: Arc<R>,
        config: QuorumConfig,
    ) -> Self {
        Self {
            view,
            storage,
            locks,
            client,
            config,
        }
    }

    pub fn local(&self) -> &NodeInfo {
        self.view.local()
    }

    pub fn view(&self) -> &Arc<ClusterView> {
        &self.view
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn client(&self) -> &Arc<R> {
        &self.client
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    async fn check_members(&self) -> Result<(), KvError> {
        let got = self.view.live_count().await;
        let needed = self.config.member_count_quorum;
        if got < needed {
            return Err(KvError::MembershipInsufficient { needed, got });
        }
        Ok(())
    }

    /// Install a table handed back by a peer, or rebuild from our own
    /// membership if it is not newer than ours.
    async fn refresh_table(&self, table: Box<RoutingTable>) {
        let version = table.version();
        if !self.view.router().accept(*table) {
            self.view.refresh_routing().await;
        }
        tracing::debug!(
            offered = version,
            current = self.view.routing_table().version(),
            "routing table refreshed after stale ownership"
        );
    }

    // -----------------------------------------------------------------------
    // Client operations
    // -----------------------------------------------------------------------

    /// GET: newest version among the first R owners to answer.
    pub async fn get(&self, dmap: &str, key: &str, deadline: Instant) -> Result<Entry, KvError> {
        self.check_members().await?;
        match self.read_once(dmap, key, deadline).await {
            Attempt::Done(result) => result,
            Attempt::Stale(table) => {
                self.refresh_table(table).await;
                match self.read_once(dmap, key, deadline).await {
                    Attempt::Done(result) => result,
                    Attempt::Stale(_) => Err(KvError::StaleOwnership),
                }
            }
        }
    }

    /// PUT, or PUTEX when `ttl` is set. Without a TTL the map's default TTL
    /// applies.
    pub async fn put(
        &self,
        dmap: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        deadline: Instant,
    ) -> Result<(), KvError> {
        let op = PrimaryOp::Put {
            dmap: dmap.to_string(),
            key: key.to_string(),
            value,
            ttl,
        };
        match self.run_on_primary(op, deadline).await? {
            ReplicaResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete(&self, dmap: &str, key: &str, deadline: Instant) -> Result<(), KvError> {
        let op = PrimaryOp::Delete {
            dmap: dmap.to_string(),
            key: key.to_string(),
        };
        match self.run_on_primary(op, deadline).await? {
            ReplicaResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Add `delta` to the integer stored at `key` (0 when absent). Returns
    /// the new value.
    pub async fn incr(
        &self,
        dmap: &str,
        key: &str,
        delta: i64,
        deadline: Instant,
    ) -> Result<i64, KvError> {
        let op = PrimaryOp::Incr {
            dmap: dmap.to_string(),
            key: key.to_string(),
            delta,
        };
        match self.run_on_primary(op, deadline).await? {
            ReplicaResponse::Counter(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Store `value` and return the previous live value.
    pub async fn get_put(
        &self,
        dmap: &str,
        key: &str,
        value: Vec<u8>,
        deadline: Instant,
    ) -> Result<Option<Vec<u8>>, KvError> {
        let op = PrimaryOp::GetPut {
            dmap: dmap.to_string(),
            key: key.to_string(),
            value,
        };
        match self.run_on_primary(op, deadline).await? {
            ReplicaResponse::Previous(previous) => Ok(previous),
            other => Err(unexpected(other)),
        }
    }

    pub async fn lock(
        &self,
        dmap: &str,
        key: &str,
        session: &str,
        ttl: Duration,
        deadline: Instant,
    ) -> Result<(), KvError> {
        let op = PrimaryOp::Lock {
            dmap: dmap.to_string(),
            key: key.to_string(),
            session: session.to_string(),
            ttl,
        };
        match self.run_on_primary(op, deadline).await? {
            ReplicaResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unlock(
        &self,
        dmap: &str,
        key: &str,
        session: &str,
        deadline: Instant,
    ) -> Result<(), KvError> {
        let op = PrimaryOp::Unlock {
            dmap: dmap.to_string(),
            key: key.to_string(),
            session: session.to_string(),
        };
        match self.run_on_primary(op, deadline).await? {
            ReplicaResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Drop a whole map on every live member.
    pub async fn destroy(&self, dmap: &str, deadline: Instant) -> Result<(), KvError> {
        self.check_members().await?;
        let members = self.view.live_nodes().await;
        let policy = self.config.retry_policy();

        let removed = self.storage.destroy_dmap(dmap).await;
        self.locks.clear_dmap(dmap);
        tracing::debug!(dmap, removed, "destroyed map locally");

        let sends = members
            .iter()
            .filter(|m| m.id != self.local().id)
            .map(|member| {
                let request = ReplicaRequest::Destroy {
                    dmap: dmap.to_string(),
                };
                send_with_retry(&*self.client, member, request, policy, deadline)
            });
        let results = futures::future::join_all(sends).await;
        let acked = 1 + results.iter().filter(|r| r.is_ok()).count();
        if acked < members.len() {
            return Err(KvError::QuorumNotReached {
                needed: members.len(),
                got: acked,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    async fn read_once(&self, dmap: &str, key: &str, deadline: Instant) -> Attempt<Entry> {
        let table = self.view.routing_table();
        let partition = table.partition_for(dmap, key);
        let owners = table.owners_of(partition).to_vec();
        let needed = self.config.read_quorum;
        if owners.len() < needed {
            return Attempt::Done(Err(KvError::QuorumNotReached {
                needed,
                got: owners.len(),
            }));
        }

        let policy = self.config.retry_policy();
        let mut futs = FuturesUnordered::new();
        for owner in owners {
            let dmap = dmap.to_string();
            let key = key.to_string();
            if owner.id == self.local().id {
                let storage = self.storage.clone();
                futs.push(tokio::spawn(async move {
                    let entry = storage.get(partition, &dmap, &key).await;
                    (owner, Ok(entry))
                }));
            } else {
                let client = self.client.clone();
                let request = ReplicaRequest::Read {
                    table_version: table.version(),
                    partition,
                    dmap,
                    key,
                };
                futs.push(tokio::spawn(async move {
                    let result =
                        match send_with_retry(&*client, &owner, request, policy, deadline).await {
                            Ok(ReplicaResponse::Entry(entry)) => Ok(entry),
                            Ok(other) => Err(ReplicaError::RpcFailed(format!(
                                "unexpected read response: {:?}",
                                other
                            ))),
                            Err(e) => Err(e),
                        };
                    (owner, result)
                }));
            }
        }

        // Collect R responses
        let mut responses: Vec<(NodeInfo, Option<Entry>)> = Vec::new();
        let mut stale_table = None;
        while let Some(joined) = tokio::time::timeout_at(deadline, futs.next())
            .await
            .ok()
            .flatten()
        {
            match joined {
                Ok((owner, Ok(entry))) => {
                    responses.push((owner, entry));
                    if responses.len() >= needed {
                        break;
                    }
                }
                Ok((owner, Err(ReplicaError::StaleOwnership { table, .. }))) => {
                    tracing::debug!(owner = %owner, "owner reports stale routing table");
                    stale_table = Some(table);
                }
                Ok((owner, Err(e))) => {
                    tracing::debug!(owner = %owner, "read failed: {}", e);
                }
                Err(e) => {
                    tracing::warn!("read task failed: {}", e);
                }
            }
        }

        if responses.len() < needed {
            if let Some(table) = stale_table {
                return Attempt::Stale(table);
            }
            return Attempt::Done(Err(KvError::QuorumNotReached {
                needed,
                got: responses.len(),
            }));
        }

        let Some(winner) = newest(responses.iter().filter_map(|(_, e)| e.as_ref())).cloned()
        else {
            return Attempt::Done(Err(KvError::NotFound));
        };

        if self.config.read_repair {
            let lagging: Vec<NodeInfo> = responses
                .into_iter()
                .filter(|(_, entry)| entry.as_ref().map_or(true, |e| winner.supersedes(e)))
                .map(|(owner, _)| owner)
                .collect();
            if !lagging.is_empty() {
                self.spawn_read_repair(table.version(), partition, dmap, winner.clone(), lagging);
            }
        }

        Attempt::Done(Ok(winner))
    }

    /// Push `winner` to owners that answered with an older copy or none.
    fn spawn_read_repair(
        &self,
        table_version: u64,
        partition: PartitionId,
        dmap: &str,
        winner: Entry,
        lagging: Vec<NodeInfo>,
    ) {
        let storage = self.storage.clone();
        let client = self.client.clone();
        let local_id = self.local().id;
        let policy = self.config.retry_policy();
        let deadline = Instant::now() + self.config.operation_timeout;
        let dmap = dmap.to_string();

        tokio::spawn(async move {
            for owner in lagging {
                let repaired = if owner.id == local_id {
                    storage.put(partition, &dmap, winner.clone()).await;
                    true
                } else {
                    let request = ReplicaRequest::Write {
                        table_version,
                        partition,
                        dmap: dmap.clone(),
                        entry: winner.clone(),
                    };
                    match send_with_retry(&*client, &owner, request, policy, deadline).await {
                        Ok(_) => true,
                        Err(e) => {
                            tracing::debug!(owner = %owner, key = %winner.key, "read repair failed: {}", e);
                            false
                        }
                    }
                };
                if repaired {
                    dmap_metrics::metrics().read_repairs.inc();
                    tracing::debug!(owner = %owner, key = %winner.key, version = winner.version, "read repair");
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Primary path
    // -----------------------------------------------------------------------

    async fn run_on_primary(
        &self,
        op: PrimaryOp,
        deadline: Instant,
    ) -> Result<ReplicaResponse, KvError> {
        self.check_members().await?;
        match self.primary_once(&op, deadline).await {
            Attempt::Done(result) => result,
            Attempt::Stale(table) => {
                self.refresh_table(table).await;
                match self.primary_once(&op, deadline).await {
                    Attempt::Done(result) => result,
                    Attempt::Stale(_) => Err(KvError::StaleOwnership),
                }
            }
        }
    }

    async fn primary_once(&self, op: &PrimaryOp, deadline: Instant) -> Attempt<ReplicaResponse> {
        let table = self.view.routing_table();
        let partition = table.partition_for(op.dmap(), op.key());
        let Some(primary) = table.primary_of(partition).cloned() else {
            return Attempt::Done(Err(KvError::QuorumNotReached {
                needed: self.config.write_quorum,
                got: 0,
            }));
        };

        if primary.id == self.local().id {
            return Attempt::Done(
                self.execute_primary(&table, partition, op.clone(), deadline)
                    .await,
            );
        }

        let request = ReplicaRequest::Primary {
            table_version: table.version(),
            partition,
            op: op.clone(),
            budget: deadline.saturating_duration_since(Instant::now()),
        };
        let policy = self.config.retry_policy();
        match send_with_retry(&*self.client, &primary, request, policy, deadline).await {
            Ok(response) => Attempt::Done(Ok(response)),
            Err(ReplicaError::StaleOwnership { table, .. }) => Attempt::Stale(table),
            Err(ReplicaError::Rejected(e)) => Attempt::Done(Err(e)),
            Err(ReplicaError::Timeout) => Attempt::Done(Err(KvError::Timeout)),
            Err(e) => {
                tracing::debug!(primary = %primary, "primary unreachable: {}", e);
                Attempt::Done(Err(KvError::QuorumNotReached {
                    needed: self.config.write_quorum,
                    got: 0,
                }))
            }
        }
    }

    /// Run `op` with this node as primary of `partition`.
    async fn execute_primary(
        &self,
        table: &RoutingTable,
        partition: PartitionId,
        op: PrimaryOp,
        deadline: Instant,
    ) -> Result<ReplicaResponse, KvError> {
        match op {
            PrimaryOp::Put {
                dmap,
                key,
                value,
                ttl,
            } => {
                let _guard = self.acquire_key(&dmap, &key, KeyLock::Write, deadline).await?;
                let expires_at_ms = self.expiry_for(&dmap, ttl);
                let (entry, _) = self
                    .storage
                    .put_versioned(partition, &dmap, &key, value, expires_at_ms)
                    .await;
                self.replicate(table, partition, &dmap, Replication::Write(entry), deadline)
                    .await?;
                Ok(ReplicaResponse::Ack)
            }
            PrimaryOp::Delete { dmap, key } => {
                let _guard = self.acquire_key(&dmap, &key, KeyLock::Write, deadline).await?;
                self.storage.delete(partition, &dmap, &key).await;
                self.replicate(table, partition, &dmap, Replication::Remove(key), deadline)
                    .await?;
                Ok(ReplicaResponse::Ack)
            }
            PrimaryOp::Incr { dmap, key, delta } => {
                let _guard = self.acquire_key(&dmap, &key, KeyLock::Update, deadline).await?;
                let current = self.storage.get(partition, &dmap, &key).await;
                let base = match &current {
                    Some(entry) => parse_counter(&entry.value)?,
                    None => 0,
                };
                let next = base.wrapping_add(delta);
                let expires_at_ms = current.and_then(|e| e.expires_at_ms);
                let (entry, _) = self
                    .storage
                    .put_versioned(
                        partition,
                        &dmap,
                        &key,
                        next.to_string().into_bytes(),
                        expires_at_ms,
                    )
                    .await;
                self.replicate(table, partition, &dmap, Replication::Write(entry), deadline)
                    .await?;
                Ok(ReplicaResponse::Counter(next))
            }
            PrimaryOp::GetPut { dmap, key, value } => {
                let _guard = self.acquire_key(&dmap, &key, KeyLock::Update, deadline).await?;
                let expires_at_ms = self.expiry_for(&dmap, None);
                let (entry, previous) = self
                    .storage
                    .put_versioned(partition, &dmap, &key, value, expires_at_ms)
                    .await;
                self.replicate(table, partition, &dmap, Replication::Write(entry), deadline)
                    .await?;
                Ok(ReplicaResponse::Previous(previous.map(|e| e.value)))
            }
            PrimaryOp::Lock {
                dmap,
                key,
                session,
                ttl,
            } => {
                self.locks
                    .try_acquire(&dmap, &key, LockToken::External(session), ttl)
                    .map_err(lock_error)?;
                Ok(ReplicaResponse::Ack)
            }
            PrimaryOp::Unlock { dmap, key, session } => {
                self.locks
                    .release(&dmap, &key, &LockToken::External(session))
                    .map_err(lock_error)?;
                Ok(ReplicaResponse::Ack)
            }
        }
    }

    /// Absolute expiry for a write: the explicit TTL, else the map default.
    fn expiry_for(&self, dmap: &str, ttl: Option<Duration>) -> Option<u64> {
        let ttl_ms = match ttl {
            Some(ttl) => u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            None => match self.storage.settings_for(dmap).ttl_ms {
                0 => return None,
                ms => ms,
            },
        };
        Some(dmap_common::unix_millis().saturating_add(ttl_ms))
    }

    /// Take the internal lock on a key, backing off while a conflicting
    /// holder has it. Never waits past `deadline`.
    async fn acquire_key(
        &self,
        dmap: &str,
        key: &str,
        mode: KeyLock,
        deadline: Instant,
    ) -> Result<InternalLockGuard<'_>, KvError> {
        let ttl = self.config.operation_timeout;
        let mut wait = LOCK_RETRY_MIN;
        loop {
            let attempt = match mode {
                KeyLock::Update => InternalLockGuard::try_new(&self.locks, dmap, key, ttl),
                KeyLock::Write => InternalLockGuard::try_write(&self.locks, dmap, key, ttl),
            };
            if let Ok(guard) = attempt {
                return Ok(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(dmap, key, "gave up waiting for key lock");
                return Err(KvError::Timeout);
            }
            let jitter_us = rand::thread_rng().gen_range(0..=wait.as_micros() as u64);
            let sleep_for = (wait + Duration::from_micros(jitter_us)).min(deadline - now);
            tokio::time::sleep(sleep_for).await;
            wait = (wait * 2).min(LOCK_RETRY_MAX);
        }
    }

    /// Push a change to the backups of `partition`.
    ///
    /// Sync mode returns once W owners (the primary included) hold the
    /// change. Async mode returns at once and replicates in the background.
    /// Either way every backup is attempted; failures are logged as
    /// degraded writes.
    async fn replicate(
        &self,
        table: &RoutingTable,
        partition: PartitionId,
        dmap: &str,
        change: Replication,
        deadline: Instant,
    ) -> Result<(), KvError> {
        let backups: Vec<NodeInfo> = table
            .owners_of(partition)
            .iter()
            .filter(|n| n.id != self.local().id)
            .cloned()
            .collect();
        let request = change.request(table.version(), partition, dmap);
        let policy = self.config.retry_policy();

        let mut futs = FuturesUnordered::new();
        for backup in backups {
            let client = self.client.clone();
            let request = request.clone();
            // Background replication gets its own budget.
            let deadline = match self.config.replication_mode {
                ReplicationMode::Sync => deadline,
                ReplicationMode::Async => Instant::now() + self.config.operation_timeout,
            };
            futs.push(tokio::spawn(async move {
                let result = send_with_retry(&*client, &backup, request, policy, deadline).await;
                if let Err(e) = &result {
                    dmap_metrics::metrics().degraded_writes.inc();
                    tracing::warn!(backup = %backup, partition, "replication failed: {}", e);
                }
                result.is_ok()
            }));
        }

        if self.config.replication_mode == ReplicationMode::Async {
            return Ok(());
        }

        // Wait for W acks with deadline
        let needed = self.config.write_quorum;
        let mut acks = 1usize;
        while acks < needed {
            match tokio::time::timeout_at(deadline, futs.next()).await {
                Ok(Some(Ok(true))) => acks += 1,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        if acks < needed {
            return Err(KvError::QuorumNotReached { needed, got: acks });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Serving peers
    // -----------------------------------------------------------------------

    /// Handle a data request from a peer.
    pub async fn handle_request(
        &self,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, ReplicaError> {
        match request {
            ReplicaRequest::Read {
                table_version,
                partition,
                dmap,
                key,
            } => {
                self.check_owner(partition, table_version, false)?;
                let entry = self.storage.get(partition, &dmap, &key).await;
                Ok(ReplicaResponse::Entry(entry))
            }
            ReplicaRequest::Write {
                table_version,
                partition,
                dmap,
                entry,
            } => {
                self.check_owner(partition, table_version, false)?;
                let stored = self.storage.put(partition, &dmap, entry).await;
                Ok(ReplicaResponse::Stored(stored))
            }
            ReplicaRequest::Remove {
                table_version,
                partition,
                dmap,
                key,
            } => {
                self.check_owner(partition, table_version, false)?;
                self.storage.delete(partition, &dmap, &key).await;
                Ok(ReplicaResponse::Ack)
            }
            ReplicaRequest::Primary {
                table_version,
                partition,
                op,
                budget,
            } => {
                let table = self.check_owner(partition, table_version, true)?;
                let deadline = Instant::now() + budget.min(self.config.operation_timeout);
                self.execute_primary(&table, partition, op, deadline)
                    .await
                    .map_err(ReplicaError::Rejected)
            }
            ReplicaRequest::Destroy { dmap } => {
                let removed = self.storage.destroy_dmap(&dmap).await;
                self.locks.clear_dmap(&dmap);
                tracing::debug!(dmap = %dmap, removed, "destroyed map on request");
                Ok(ReplicaResponse::Ack)
            }
            ReplicaRequest::Migrate {
                table_version,
                partition,
                fragments,
            } => {
                self.check_owner(partition, table_version, false)?;
                let imported = self.storage.import(partition, fragments).await;
                tracing::debug!(partition, imported, "imported migrated partition");
                Ok(ReplicaResponse::Imported(imported))
            }
        }
    }

    /// Reject a request for a partition this node does not own, unless the
    /// sender's table is newer than ours.
    fn check_owner(
        &self,
        partition: PartitionId,
        sender_version: u64,
        as_primary: bool,
    ) -> Result<Arc<RoutingTable>, ReplicaError> {
        let table = self.view.routing_table();
        let local = self.local().id;
        let owns = if as_primary {
            table.primary_of(partition).is_some_and(|p| p.id == local)
        } else {
            table.is_owner(partition, &local)
        };
        if owns || sender_version > table.version() {
            return Ok(table);
        }
        Err(ReplicaError::StaleOwnership {
            partition,
            table: Box::new((*table).clone()),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The entry that wins last-writer-wins: highest version, then latest
/// timestamp.
pub fn newest<'a>(entries: impl Iterator<Item = &'a Entry>) -> Option<&'a Entry> {
    entries.max_by(|a, b| (a.version, a.timestamp_ms).cmp(&(b.version, b.timestamp_ms)))
}

/// Counters are stored as ASCII decimal integers.
pub fn parse_counter(value: &[u8]) -> Result<i64, KvError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or(KvError::NotAnInteger)
}

fn lock_error(e: LockError) -> KvError {
    match e {
        LockError::Held | LockError::NotHolder => {
            dmap_metrics::metrics().lock_conflicts.inc();
            KvError::LockConflict
        }
    }
}

fn unexpected(response: ReplicaResponse) -> KvError {
    KvError::UnexpectedResponse(format!("{:?}", response))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use dmap_cluster::member::{MemberUpdate, NodeStatus};
    use dmap_cluster::ClusterConfig;
    use dmap_storage::StorageConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // -----------------------------------------------------------------------
    // Mock ReplicaClients
    // -----------------------------------------------------------------------

    /// Rejects everything; for single-node tests that never go remote.
    struct UnreachableClient;

    #[async_trait::async_trait]
    impl ReplicaClient for UnreachableClient {
        async fn send(
            &self,
            _target: &NodeInfo,
            _request: ReplicaRequest,
        ) -> Result<ReplicaResponse, ReplicaError> {
            Err(ReplicaError::RpcFailed("unreachable".into()))
        }
    }

    /// Answers every request with StaleOwnership carrying a fixed table.
    struct StaleClient {
        table: RoutingTable,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ReplicaClient for StaleClient {
        async fn send(
            &self,
            _target: &NodeInfo,
            request: ReplicaRequest,
        ) -> Result<ReplicaResponse, ReplicaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let partition = match request {
                ReplicaRequest::Primary { partition, .. } => partition,
                _ => 0,
            };
            Err(ReplicaError::StaleOwnership {
                partition,
                table: Box::new(self.table.clone()),
            })
        }
    }

    fn addr(port: u16) -> std::net::SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn quorum() -> QuorumConfig {
        QuorumConfig {
            replication_mode: ReplicationMode::Sync,
            write_quorum: 1,
            read_quorum: 1,
            read_repair: false,
            member_count_quorum: 1,
            operation_timeout: Duration::from_secs(2),
            max_retries: 0,
            backoff_min: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    fn cluster_config() -> ClusterConfig {
        ClusterConfig {
            partition_count: 31,
            replica_count: 1,
            ..Default::default()
        }
    }

    fn coordinator<R: ReplicaClient>(client: R, config: QuorumConfig) -> Coordinator<R> {
        let view = Arc::new(ClusterView::new(
            NodeInfo::with_birthdate(addr(7000), 1),
            &cluster_config(),
        ));
        let storage = Arc::new(StorageEngine::new(StorageConfig::new(31)));
        Coordinator::new(
            view,
            storage,
            Arc::new(LockManager::new()),
            Arc::new(client),
            config,
        )
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    /// Add a second live member so part of the key space moves to it.
    async fn add_peer<R: ReplicaClient>(coord: &Coordinator<R>) -> NodeInfo {
        let peer = NodeInfo::with_birthdate(addr(7001), 2);
        coord
            .view()
            .apply(vec![MemberUpdate {
                node: peer.clone(),
                status: NodeStatus::Alive,
                incarnation: 0,
                from: peer.id,
            }])
            .await;
        peer
    }

    /// A key whose primary is `owner` in `table`.
    fn key_owned_by(table: &RoutingTable, owner: &NodeInfo) -> String {
        (0..10_000)
            .map(|i| format!("key-{}", i))
            .find(|k| {
                let p = table.partition_for("m", k);
                table.primary_of(p).is_some_and(|n| n.id == owner.id)
            })
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // Single-node operations
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_put_get_delete() {
        let coord = coordinator(UnreachableClient, quorum());
        coord.put("m", "k", b"v1".to_vec(), None, deadline()).await.unwrap();
        assert_eq!(coord.get("m", "k", deadline()).await.unwrap().value, b"v1");

        coord.put("m", "k", b"v2".to_vec(), None, deadline()).await.unwrap();
        let entry = coord.get("m", "k", deadline()).await.unwrap();
        assert_eq!(entry.value, b"v2");

        coord.delete("m", "k", deadline()).await.unwrap();
        assert_eq!(coord.get("m", "k", deadline()).await, Err(KvError::NotFound));
    }

    #[tokio::test]
    async fn test_incr_decr_and_non_integer() {
        let coord = coordinator(UnreachableClient, quorum());
        assert_eq!(coord.incr("m", "c", 5, deadline()).await, Ok(5));
        assert_eq!(coord.incr("m", "c", -7, deadline()).await, Ok(-2));
        assert_eq!(coord.get("m", "c", deadline()).await.unwrap().value, b"-2");

        coord.put("m", "s", b"hello".to_vec(), None, deadline()).await.unwrap();
        assert_eq!(
            coord.incr("m", "s", 1, deadline()).await,
            Err(KvError::NotAnInteger)
        );
    }

    #[tokio::test]
    async fn test_get_put_returns_previous() {
        let coord = coordinator(UnreachableClient, quorum());
        assert_eq!(coord.get_put("m", "k", b"a".to_vec(), deadline()).await, Ok(None));
        assert_eq!(
            coord.get_put("m", "k", b"b".to_vec(), deadline()).await,
            Ok(Some(b"a".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_lock_unlock_sessions() {
        let coord = coordinator(UnreachableClient, quorum());
        let ttl = Duration::from_secs(5);
        coord.lock("m", "k", "alice", ttl, deadline()).await.unwrap();
        assert_eq!(
            coord.lock("m", "k", "bob", ttl, deadline()).await,
            Err(KvError::LockConflict)
        );
        assert_eq!(
            coord.unlock("m", "k", "bob", deadline()).await,
            Err(KvError::LockConflict)
        );
        coord.unlock("m", "k", "alice", deadline()).await.unwrap();
        coord.lock("m", "k", "bob", ttl, deadline()).await.unwrap();
    }

    #[tokio::test]
    async fn test_incr_waits_out_client_lock() {
        let coord = coordinator(UnreachableClient, quorum());
        coord
            .lock("m", "c", "alice", Duration::from_millis(50), deadline())
            .await
            .unwrap();
        // The internal lock is retried until the client lease runs out.
        assert_eq!(coord.incr("m", "c", 1, deadline()).await, Ok(1));

        coord
            .lock("m", "c", "alice", Duration::from_secs(60), deadline())
            .await
            .unwrap();
        let short = Instant::now() + Duration::from_millis(30);
        assert_eq!(coord.incr("m", "c", 1, short).await, Err(KvError::Timeout));
    }

    #[tokio::test]
    async fn test_plain_writes_wait_for_atomic_update() {
        let coord = coordinator(UnreachableClient, quorum());
        coord.put("m", "c", b"1".to_vec(), None, deadline()).await.unwrap();
        let update =
            InternalLockGuard::try_new(coord.locks(), "m", "c", Duration::from_secs(5)).unwrap();

        let short = || Instant::now() + Duration::from_millis(30);
        assert_eq!(
            coord.put("m", "c", b"2".to_vec(), None, short()).await,
            Err(KvError::Timeout)
        );
        assert_eq!(coord.delete("m", "c", short()).await, Err(KvError::Timeout));
        assert_eq!(coord.get("m", "c", deadline()).await.unwrap().value, b"1");

        drop(update);
        coord.put("m", "c", b"2".to_vec(), None, deadline()).await.unwrap();
        assert_eq!(coord.get("m", "c", deadline()).await.unwrap().value, b"2");
    }

    #[tokio::test]
    async fn test_plain_writes_ignore_client_lock() {
        let coord = coordinator(UnreachableClient, quorum());
        coord
            .lock("m", "k", "alice", Duration::from_secs(60), deadline())
            .await
            .unwrap();
        coord.put("m", "k", b"v".to_vec(), None, deadline()).await.unwrap();
        coord.delete("m", "k", deadline()).await.unwrap();
        // The client lock is still in place.
        assert_eq!(
            coord.lock("m", "k", "bob", Duration::from_secs(1), deadline()).await,
            Err(KvError::LockConflict)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_put_and_incr_keep_both_or_order() {
        let coord = Arc::new(coordinator(UnreachableClient, quorum()));
        for _ in 0..200 {
            coord.put("m", "c", b"10".to_vec(), None, deadline()).await.unwrap();
            let incr = {
                let coord = coord.clone();
                tokio::spawn(async move { coord.incr("m", "c", 5, deadline()).await })
            };
            let put = {
                let coord = coord.clone();
                tokio::spawn(async move {
                    coord.put("m", "c", b"100".to_vec(), None, deadline()).await
                })
            };
            let counter = incr.await.unwrap().unwrap();
            put.await.unwrap().unwrap();

            let last = coord.get("m", "c", deadline()).await.unwrap().value;
            // Either the incr ran first and the put replaced it, or the
            // incr saw the put.
            match counter {
                15 => assert_eq!(last, b"100"),
                105 => assert_eq!(last, b"105"),
                other => panic!("incr returned {}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates() {
        let coord = coordinator(UnreachableClient, quorum());
        coord
            .put("m", "k", b"v".to_vec(), Some(Duration::MAX), deadline())
            .await
            .unwrap();
        let entry = coord.get("m", "k", deadline()).await.unwrap();
        assert_eq!(entry.expires_at_ms, Some(u64::MAX));
    }

    #[tokio::test]
    async fn test_put_ex_and_default_ttl() {
        let coord = coordinator(UnreachableClient, quorum());
        coord
            .put("m", "k", b"v".to_vec(), Some(Duration::from_secs(60)), deadline())
            .await
            .unwrap();
        let entry = coord.get("m", "k", deadline()).await.unwrap();
        assert!(entry.expires_at_ms.is_some());

        coord
            .put("m", "gone", b"v".to_vec(), Some(Duration::ZERO), deadline())
            .await
            .unwrap();
        assert_eq!(coord.get("m", "gone", deadline()).await, Err(KvError::NotFound));
    }

    #[tokio::test]
    async fn test_member_count_quorum_refuses() {
        let config = QuorumConfig {
            member_count_quorum: 2,
            ..quorum()
        };
        let coord = coordinator(UnreachableClient, config);
        assert_eq!(
            coord.put("m", "k", b"v".to_vec(), None, deadline()).await,
            Err(KvError::MembershipInsufficient { needed: 2, got: 1 })
        );
        assert_eq!(
            coord.get("m", "k", deadline()).await,
            Err(KvError::MembershipInsufficient { needed: 2, got: 1 })
        );
    }

    #[tokio::test]
    async fn test_write_quorum_above_owners_fails() {
        let config = QuorumConfig {
            write_quorum: 2,
            ..quorum()
        };
        let coord = coordinator(UnreachableClient, config);
        assert_eq!(
            coord.put("m", "k", b"v".to_vec(), None, deadline()).await,
            Err(KvError::QuorumNotReached { needed: 2, got: 1 })
        );
    }

    #[tokio::test]
    async fn test_destroy_local() {
        let coord = coordinator(UnreachableClient, quorum());
        for i in 0..10 {
            coord
                .put("gone", &format!("k{}", i), b"v".to_vec(), None, deadline())
                .await
                .unwrap();
        }
        coord.put("kept", "k", b"v".to_vec(), None, deadline()).await.unwrap();
        coord.destroy("gone", deadline()).await.unwrap();
        assert_eq!(coord.get("gone", "k3", deadline()).await, Err(KvError::NotFound));
        assert!(coord.get("kept", "k", deadline()).await.is_ok());
    }

    // -----------------------------------------------------------------------
    // Ownership
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_unreachable_primary_is_quorum_error() {
        let coord = coordinator(UnreachableClient, quorum());
        let peer = add_peer(&coord).await;
        let key = key_owned_by(&coord.view().routing_table(), &peer);
        assert_eq!(
            coord.put("m", &key, b"v".to_vec(), None, deadline()).await,
            Err(KvError::QuorumNotReached { needed: 1, got: 0 })
        );
    }

    #[tokio::test]
    async fn test_stale_ownership_refreshes_and_retries_once() {
        // The peer hands back a newer table in which we own everything.
        let local = NodeInfo::with_birthdate(addr(7000), 1);
        let table = RoutingTable::build(100, 31, 1, &[local]);
        let coord = coordinator(
            StaleClient {
                table,
                calls: AtomicUsize::new(0),
            },
            quorum(),
        );
        let peer = add_peer(&coord).await;
        let key = key_owned_by(&coord.view().routing_table(), &peer);

        coord.put("m", &key, b"v".to_vec(), None, deadline()).await.unwrap();
        assert_eq!(coord.client().calls.load(Ordering::SeqCst), 1);
        assert_eq!(coord.view().routing_table().version(), 100);
        assert_eq!(coord.get("m", &key, deadline()).await.unwrap().value, b"v");
    }

    #[tokio::test]
    async fn test_repeated_staleness_is_surfaced() {
        let local = NodeInfo::with_birthdate(addr(7000), 1);
        let peer = NodeInfo::with_birthdate(addr(7001), 2);
        let table = RoutingTable::build(100, 31, 1, &[local, peer]);
        let coord = coordinator(
            StaleClient {
                table,
                calls: AtomicUsize::new(0),
            },
            quorum(),
        );
        let peer = add_peer(&coord).await;
        let key = key_owned_by(&coord.view().routing_table(), &peer);

        assert_eq!(
            coord.put("m", &key, b"v".to_vec(), None, deadline()).await,
            Err(KvError::StaleOwnership)
        );
        assert_eq!(coord.client().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handle_request_rejects_foreign_partition() {
        let coord = coordinator(UnreachableClient, quorum());
        let peer = add_peer(&coord).await;
        let table = coord.view().routing_table();
        let key = key_owned_by(&table, &peer);
        let partition = table.partition_for("m", &key);

        let read = |version| ReplicaRequest::Read {
            table_version: version,
            partition,
            dmap: "m".into(),
            key: key.clone(),
        };
        assert!(matches!(
            coord.handle_request(read(table.version())).await,
            Err(ReplicaError::StaleOwnership { .. })
        ));
        // A sender with a newer table is trusted.
        assert_eq!(
            coord.handle_request(read(table.version() + 1)).await.unwrap(),
            ReplicaResponse::Entry(None)
        );
    }

    #[tokio::test]
    async fn test_handle_write_is_last_writer_wins() {
        let coord = coordinator(UnreachableClient, quorum());
        let table = coord.view().routing_table();
        let partition = table.partition_for("m", "k");
        let write = |version, value: &str| ReplicaRequest::Write {
            table_version: table.version(),
            partition,
            dmap: "m".into(),
            entry: Entry::new("k".into(), value.as_bytes().to_vec(), version, dmap_common::unix_millis()),
        };
        assert_eq!(
            coord.handle_request(write(5, "new")).await.unwrap(),
            ReplicaResponse::Stored(true)
        );
        assert_eq!(
            coord.handle_request(write(4, "old")).await.unwrap(),
            ReplicaResponse::Stored(false)
        );
        assert_eq!(coord.get("m", "k", deadline()).await.unwrap().value, b"new");
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    #[test]
    fn test_newest_by_version_then_timestamp() {
        let a = Entry::new("k".into(), b"a".to_vec(), 3, 100);
        let b = Entry::new("k".into(), b"b".to_vec(), 3, 200);
        let c = Entry::new("k".into(), b"c".to_vec(), 2, 900);
        let all = [a, b, c];
        assert_eq!(newest(all.iter()).unwrap().value, b"b");
        assert!(newest(std::iter::empty()).is_none());
    }

    #[test]
    fn test_parse_counter() {
        assert_eq!(parse_counter(b"42"), Ok(42));
        assert_eq!(parse_counter(b"-7"), Ok(-7));
        assert_eq!(parse_counter(b"4.2"), Err(KvError::NotAnInteger));
        assert_eq!(parse_counter(&[0xff, 0xfe]), Err(KvError::NotAnInteger));
    }
}
