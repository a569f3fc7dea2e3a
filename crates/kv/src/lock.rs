//! Per-key lock table.
//!
//! One table holds both client locks and the short-lived locks the primary
//! takes around atomic read-modify-write operations. The two are told apart
//! by their token, so a client session can never release an internal lock
//! and vice versa.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockToken {
    /// Held on behalf of a client session.
    External(String),
    /// Held by the primary for the duration of one atomic update.
    Internal(uuid::Uuid),
}

impl LockToken {
    pub fn internal() -> Self {
        LockToken::Internal(uuid::Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("key is locked by another holder")]
    Held,
    #[error("caller does not hold the lock")]
    NotHolder,
}

#[derive(Debug, Clone)]
struct LockRecord {
    token: LockToken,
    expires_at: Instant,
    /// A plain write running under a client lock.
    writer: Option<(uuid::Uuid, Instant)>,
}

impl LockRecord {
    fn new(token: LockToken, expires_at: Instant) -> Self {
        Self {
            token,
            expires_at,
            writer: None,
        }
    }

    fn lease_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn writer_live(&self, now: Instant) -> bool {
        self.writer.is_some_and(|(_, until)| now < until)
    }

    /// Neither the lease nor a nested write is live.
    fn is_free(&self, now: Instant) -> bool {
        self.lease_expired(now) && !self.writer_live(now)
    }
}

type LockKey = (String, String);

#[derive(Debug, Default)]
pub struct LockManager {
    locks: DashMap<LockKey, LockRecord>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock on `(dmap, key)` for `ttl`. Re-locking with the token
    /// that already holds it extends the lease.
    pub fn try_acquire(
        &self,
        dmap: &str,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> Result<(), LockError> {
        let now = Instant::now();
        match self.locks.entry((dmap.to_string(), key.to_string())) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if current.is_free(now) {
                    *current = LockRecord::new(token, now + ttl);
                    Ok(())
                } else if current.token == token && !current.lease_expired(now) {
                    current.expires_at = now + ttl;
                    Ok(())
                } else {
                    Err(LockError::Held)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockRecord::new(token, now + ttl));
                Ok(())
            }
        }
    }

    /// Register a plain write on `(dmap, key)`. A free key is taken like an
    /// internal lock; a key under a client lock with no other write running
    /// records the write next to the client's lease.
    fn try_write(
        &self,
        dmap: &str,
        key: &str,
        id: uuid::Uuid,
        ttl: Duration,
    ) -> Result<(), LockError> {
        let now = Instant::now();
        match self.locks.entry((dmap.to_string(), key.to_string())) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if current.is_free(now) {
                    *current = LockRecord::new(LockToken::Internal(id), now + ttl);
                    Ok(())
                } else if matches!(current.token, LockToken::External(_))
                    && !current.lease_expired(now)
                    && !current.writer_live(now)
                {
                    current.writer = Some((id, now + ttl));
                    Ok(())
                } else {
                    Err(LockError::Held)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockRecord::new(LockToken::Internal(id), now + ttl));
                Ok(())
            }
        }
    }

    /// Release a lock held by `token`. Expired locks are treated as absent.
    /// A write still running under the released lock keeps the key until it
    /// finishes.
    pub fn release(&self, dmap: &str, key: &str, token: &LockToken) -> Result<(), LockError> {
        let now = Instant::now();
        let lock_key = (dmap.to_string(), key.to_string());
        if let Entry::Occupied(mut occupied) = self.locks.entry(lock_key) {
            let current = occupied.get_mut();
            if current.token == *token && !current.lease_expired(now) {
                match current.writer.take() {
                    Some((id, until)) if now < until => {
                        *current = LockRecord::new(LockToken::Internal(id), until);
                    }
                    _ => {
                        occupied.remove();
                    }
                }
                return Ok(());
            }
            if current.is_free(now) {
                occupied.remove();
            }
        }
        Err(LockError::NotHolder)
    }

    /// Finish a plain write registered with `try_write`.
    fn release_write(&self, dmap: &str, key: &str, id: uuid::Uuid) {
        let lock_key = (dmap.to_string(), key.to_string());
        if let Entry::Occupied(mut occupied) = self.locks.entry(lock_key) {
            let current = occupied.get_mut();
            if current.token == LockToken::Internal(id) {
                occupied.remove();
            } else if current.writer.is_some_and(|(w, _)| w == id) {
                current.writer = None;
            }
        }
    }

    pub fn is_locked(&self, dmap: &str, key: &str) -> bool {
        let now = Instant::now();
        self.locks
            .get(&(dmap.to_string(), key.to_string()))
            .is_some_and(|r| !r.is_free(now))
    }

    /// Drop every lock on keys of `dmap`.
    pub fn clear_dmap(&self, dmap: &str) {
        self.locks.retain(|(d, _), _| d != dmap);
    }

    /// Remove expired records. Returns how many were reclaimed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.locks.len();
        self.locks.retain(|_, r| !r.is_free(now));
        before.saturating_sub(self.locks.len())
    }

    /// Records held, expired ones included.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[derive(Debug)]
enum Held {
    Exclusive(LockToken),
    Write(uuid::Uuid),
}

/// Releases an internal lock when dropped.
pub struct InternalLockGuard<'a> {
    manager: &'a LockManager,
    dmap: String,
    key: String,
    held: Held,
}

impl<'a> InternalLockGuard<'a> {
    /// Take an internal lock for a read-modify-write, or fail immediately if
    /// anyone holds the key.
    pub fn try_new(
        manager: &'a LockManager,
        dmap: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<Self, LockError> {
        let token = LockToken::internal();
        manager.try_acquire(dmap, key, token.clone(), ttl)?;
        Ok(Self {
            manager,
            dmap: dmap.to_string(),
            key: key.to_string(),
            held: Held::Exclusive(token),
        })
    }

    /// Take the key for a plain write. Client locks are advisory for plain
    /// writes, so this only fails while another internal holder or another
    /// write has the key.
    pub fn try_write(
        manager: &'a LockManager,
        dmap: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<Self, LockError> {
        let id = uuid::Uuid::new_v4();
        manager.try_write(dmap, key, id, ttl)?;
        Ok(Self {
            manager,
            dmap: dmap.to_string(),
            key: key.to_string(),
            held: Held::Write(id),
        })
    }
}

impl Drop for InternalLockGuard<'_> {
    fn drop(&mut self) {
        match &self.held {
            Held::Exclusive(token) => {
                let _ = self.manager.release(&self.dmap, &self.key, token);
            }
            Held::Write(id) => self.manager.release_write(&self.dmap, &self.key, *id),
        }
    }
}

impl std::fmt::Debug for InternalLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalLockGuard")
            .field("dmap", &self.dmap)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(name: &str) -> LockToken {
        LockToken::External(name.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_sessions() {
        let locks = LockManager::new();
        let ttl = Duration::from_secs(10);
        locks.try_acquire("m", "k", session("a"), ttl).unwrap();
        assert_eq!(
            locks.try_acquire("m", "k", session("b"), ttl),
            Err(LockError::Held)
        );
        // Different key, different map: independent.
        locks.try_acquire("m", "other", session("b"), ttl).unwrap();
        locks.try_acquire("n", "k", session("b"), ttl).unwrap();

        assert_eq!(locks.release("m", "k", &session("b")), Err(LockError::NotHolder));
        locks.release("m", "k", &session("a")).unwrap();
        locks.try_acquire("m", "k", session("b"), ttl).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_session_extends_lease() {
        let locks = LockManager::new();
        locks
            .try_acquire("m", "k", session("a"), Duration::from_millis(100))
            .unwrap();
        tokio::time::advance(Duration::from_millis(80)).await;
        locks
            .try_acquire("m", "k", session("a"), Duration::from_millis(100))
            .unwrap();
        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(locks.is_locked("m", "k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_is_absent() {
        let locks = LockManager::new();
        locks
            .try_acquire("m", "k", session("a"), Duration::from_millis(50))
            .unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;

        assert!(!locks.is_locked("m", "k"));
        assert_eq!(locks.release("m", "k", &session("a")), Err(LockError::NotHolder));
        locks
            .try_acquire("m", "k", session("b"), Duration::from_millis(50))
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_expired() {
        let locks = LockManager::new();
        for i in 0..5 {
            locks
                .try_acquire("m", &format!("k{}", i), session("a"), Duration::from_millis(10))
                .unwrap();
        }
        locks
            .try_acquire("m", "long", session("a"), Duration::from_secs(60))
            .unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(locks.reap_expired(), 5);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_internal_guard_releases_on_drop() {
        let locks = LockManager::new();
        {
            let _guard =
                InternalLockGuard::try_new(&locks, "m", "k", Duration::from_secs(1)).unwrap();
            assert!(locks.is_locked("m", "k"));
            assert_eq!(
                locks.try_acquire("m", "k", session("a"), Duration::from_secs(1)),
                Err(LockError::Held)
            );
        }
        assert!(!locks.is_locked("m", "k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_lock_blocks_internal_lock() {
        let locks = LockManager::new();
        locks
            .try_acquire("m", "k", session("a"), Duration::from_secs(1))
            .unwrap();
        assert!(InternalLockGuard::try_new(&locks, "m", "k", Duration::from_secs(1)).is_err());
        assert_eq!(
            locks.release("m", "k", &LockToken::internal()),
            Err(LockError::NotHolder)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_waits_for_internal_lock() {
        let locks = LockManager::new();
        let ttl = Duration::from_secs(1);
        let update = InternalLockGuard::try_new(&locks, "m", "k", ttl).unwrap();
        assert!(InternalLockGuard::try_write(&locks, "m", "k", ttl).is_err());
        drop(update);

        let write = InternalLockGuard::try_write(&locks, "m", "k", ttl).unwrap();
        assert!(InternalLockGuard::try_write(&locks, "m", "k", ttl).is_err());
        assert!(InternalLockGuard::try_new(&locks, "m", "k", ttl).is_err());
        drop(write);
        assert!(!locks.is_locked("m", "k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_runs_under_client_lock() {
        let locks = LockManager::new();
        let ttl = Duration::from_secs(1);
        locks.try_acquire("m", "k", session("a"), ttl).unwrap();

        let write = InternalLockGuard::try_write(&locks, "m", "k", ttl).unwrap();
        assert!(InternalLockGuard::try_write(&locks, "m", "k", ttl).is_err());
        drop(write);

        // The client lock survives the write.
        assert_eq!(locks.try_acquire("m", "k", session("b"), ttl), Err(LockError::Held));
        locks.release("m", "k", &session("a")).unwrap();
        assert!(!locks.is_locked("m", "k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_during_write_keeps_key_held() {
        let locks = LockManager::new();
        let ttl = Duration::from_secs(1);
        locks.try_acquire("m", "k", session("a"), ttl).unwrap();
        let write = InternalLockGuard::try_write(&locks, "m", "k", ttl).unwrap();

        locks.release("m", "k", &session("a")).unwrap();
        // An atomic update must not start while the write is running.
        assert!(InternalLockGuard::try_new(&locks, "m", "k", ttl).is_err());
        assert_eq!(locks.try_acquire("m", "k", session("b"), ttl), Err(LockError::Held));

        drop(write);
        assert!(!locks.is_locked("m", "k"));
        InternalLockGuard::try_new(&locks, "m", "k", ttl).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_dmap() {
        let locks = LockManager::new();
        let ttl = Duration::from_secs(1);
        locks.try_acquire("a", "k", session("s"), ttl).unwrap();
        locks.try_acquire("b", "k", session("s"), ttl).unwrap();
        locks.clear_dmap("a");
        assert!(!locks.is_locked("a", "k"));
        assert!(locks.is_locked("b", "k"));
    }
}
