//! Handle to one named map.

use crate::coordinator::Coordinator;
use crate::error::KvError;
use crate::node::OpGate;
use crate::replica_client::ReplicaClient;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// A named distributed map.
///
/// Each handle carries its own lock session: locks taken through one handle
/// can only be released through it (or a clone of it).
pub struct DMap<R: ReplicaClient> {
    name: String,
    coordinator: Arc<Coordinator<R>>,
    gate: Arc<OpGate>,
    session: String,
    timeout: Duration,
}

impl<R: ReplicaClient> Clone for DMap<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            coordinator: self.coordinator.clone(),
            gate: self.gate.clone(),
            session: self.session.clone(),
            timeout: self.timeout,
        }
    }
}

impl<R: ReplicaClient> std::fmt::Debug for DMap<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DMap")
            .field("name", &self.name)
            .field("session", &self.session)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> DMap<R> {
    pub(crate) fn new(name: &str, coordinator: Arc<Coordinator<R>>, gate: Arc<OpGate>) -> Self {
        let timeout = coordinator.config().operation_timeout;
        Self {
            name: name.to_string(),
            coordinator,
            gate,
            session: uuid::Uuid::new_v4().to_string(),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound every operation of the returned handle by `timeout` instead of
    /// the configured operation timeout. The lock session is shared.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    async fn run<T, F, Fut>(&self, op: &str, f: F) -> Result<T, KvError>
    where
        F: FnOnce(Instant) -> Fut,
        Fut: Future<Output = Result<T, KvError>>,
    {
        let _permit = self.gate.enter()?;
        let _timer = dmap_metrics::start_op_timer(op);
        let deadline = Instant::now() + self.timeout;
        let result = match tokio::time::timeout_at(deadline, f(deadline)).await {
            Ok(result) => result,
            Err(_) => Err(KvError::Timeout),
        };
        if let Err(e) = &result {
            tracing::debug!(dmap = %self.name, op, "operation failed: {}", e);
        }
        result
    }

    /// Value stored at `key`. Absent and expired keys are `NotFound`.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        self.run("get", |deadline| async move {
            let entry = self.coordinator.get(&self.name, key, deadline).await?;
            Ok(entry.value)
        })
        .await
    }

    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), KvError> {
        let value = value.into();
        self.run("put", |deadline| {
            self.coordinator.put(&self.name, key, value, None, deadline)
        })
        .await
    }

    /// Put with an expiry `ttl` from now.
    pub async fn put_ex(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Duration,
    ) -> Result<(), KvError> {
        let value = value.into();
        self.run("putex", |deadline| {
            self.coordinator
                .put(&self.name, key, value, Some(ttl), deadline)
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.run("delete", |deadline| {
            self.coordinator.delete(&self.name, key, deadline)
        })
        .await
    }

    /// Atomically add `delta`; a missing key counts as zero.
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        self.run("incr", |deadline| {
            self.coordinator.incr(&self.name, key, delta, deadline)
        })
        .await
    }

    /// Atomically subtract `delta`.
    pub async fn decr(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        self.run("decr", |deadline| {
            self.coordinator
                .incr(&self.name, key, delta.wrapping_neg(), deadline)
        })
        .await
    }

    /// Store `value` and return the value it replaced, if any.
    pub async fn get_put(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, KvError> {
        let value = value.into();
        self.run("getput", |deadline| {
            self.coordinator.get_put(&self.name, key, value, deadline)
        })
        .await
    }

    /// Drop every key of this map on every member.
    pub async fn destroy(&self) -> Result<(), KvError> {
        self.run("destroy", |deadline| {
            self.coordinator.destroy(&self.name, deadline)
        })
        .await
    }

    /// Lock `key` for `duration`. Fails at once with `LockConflict` when
    /// another session holds it.
    pub async fn lock_with_timeout(&self, key: &str, duration: Duration) -> Result<(), KvError> {
        self.run("lock", |deadline| {
            self.coordinator
                .lock(&self.name, key, &self.session, duration, deadline)
        })
        .await
    }

    pub async fn unlock(&self, key: &str) -> Result<(), KvError> {
        self.run("unlock", |deadline| {
            self.coordinator
                .unlock(&self.name, key, &self.session, deadline)
        })
        .await
    }
}
