//! Eviction: policy settings, sampling victim selection, per-fragment sweeps
//! and the background worker pool.
//!
//! Victim selection is a pure function over a random sample of keys; the
//! sweep decides how many samples to draw and the workers decide when.

use crate::engine::StorageEngine;
use crate::fragment::Fragment;
use rand::Rng;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Keys sampled per TTL sweep round.
const TTL_SAMPLE_SIZE: usize = 20;
/// A TTL round repeats while more than this fraction of its sample expired.
const TTL_REPEAT_RATIO: f64 = 0.25;
/// Upper bound on sampling rounds of one kind per fragment per pass.
const MAX_ROUNDS_PER_PASS: usize = 16;
/// Upper bound on LRU evictions per fragment per pass.
const MAX_LRU_EVICTIONS_PER_PASS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// No size-driven eviction. Expired and idle entries are still swept.
    #[default]
    None,
    /// Same as `None`: lazy expiry plus a periodic sampling sweep of TTL keys.
    Ttl,
    /// TTL sweep plus approximate-LRU eviction while over the size limits.
    Lru,
}

/// Eviction parameters resolved for one map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionSettings {
    pub policy: EvictionPolicy,
    /// Entries not accessed for this long are evicted. Zero disables.
    pub max_idle_ms: u64,
    /// Default TTL applied to plain puts. Zero means none.
    pub ttl_ms: u64,
    /// Key limit per fragment. Zero means unlimited.
    pub max_keys: usize,
    /// Approximate byte limit per fragment. Zero means unlimited.
    pub max_inuse: usize,
    pub lru_samples: usize,
}

impl Default for EvictionSettings {
    fn default() -> Self {
        Self {
            policy: EvictionPolicy::None,
            max_idle_ms: 0,
            ttl_ms: 0,
            max_keys: 0,
            max_inuse: 0,
            lru_samples: 5,
        }
    }
}

impl EvictionSettings {
    fn over_limit(&self, fragment: &Fragment) -> bool {
        (self.max_keys > 0 && fragment.len() > self.max_keys)
            || (self.max_inuse > 0 && fragment.inuse() > self.max_inuse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    Idle,
    Lru,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Idle => "idle",
            Self::Lru => "lru",
        }
    }
}

/// A sampled key with its last access time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: String,
    pub last_access_ms: u64,
}

/// The least recently used key among `candidates`. Ties go to the smallest
/// key so the choice is deterministic for a given sample.
pub fn select_victim(candidates: &[Candidate]) -> Option<&str> {
    candidates
        .iter()
        .min_by(|a, b| {
            a.last_access_ms
                .cmp(&b.last_access_ms)
                .then_with(|| a.key.cmp(&b.key))
        })
        .map(|c| c.key.as_str())
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub idle: usize,
    pub lru: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired + self.idle + self.lru
    }

    pub fn merge(&mut self, other: SweepReport) {
        self.expired += other.expired;
        self.idle += other.idle;
        self.lru += other.lru;
    }

    fn record(&self) {
        let m = dmap_metrics::metrics();
        for (reason, count) in [
            (EvictionReason::Expired, self.expired),
            (EvictionReason::Idle, self.idle),
            (EvictionReason::Lru, self.lru),
        ] {
            if count > 0 {
                m.evictions
                    .with_label_values(&[reason.as_str()])
                    .inc_by(count as u64);
            }
        }
    }
}

/// Run one eviction pass over `fragment` according to `settings`.
pub fn sweep_fragment<R: Rng + ?Sized>(
    fragment: &mut Fragment,
    settings: &EvictionSettings,
    now_ms: u64,
    rng: &mut R,
) -> SweepReport {
    let mut report = SweepReport::default();

    report.expired = sweep_expired(fragment, now_ms, rng);
    if settings.max_idle_ms > 0 {
        report.idle = sweep_idle(fragment, settings.max_idle_ms, now_ms, rng);
    }
    if settings.policy == EvictionPolicy::Lru {
        report.lru = evict_lru(fragment, settings, rng);
    }
    report
}

fn sweep_expired<R: Rng + ?Sized>(fragment: &mut Fragment, now_ms: u64, rng: &mut R) -> usize {
    let mut removed = 0;
    for _ in 0..MAX_ROUNDS_PER_PASS {
        let sample = fragment.sample_ttl_keys(TTL_SAMPLE_SIZE, rng);
        if sample.is_empty() {
            break;
        }
        let mut expired = 0;
        for key in &sample {
            if fragment.peek(key).is_some_and(|e| e.is_expired(now_ms)) {
                fragment.remove(key);
                expired += 1;
            }
        }
        removed += expired;
        if (expired as f64) <= sample.len() as f64 * TTL_REPEAT_RATIO {
            break;
        }
    }
    removed
}

fn sweep_idle<R: Rng + ?Sized>(
    fragment: &mut Fragment,
    max_idle_ms: u64,
    now_ms: u64,
    rng: &mut R,
) -> usize {
    let mut removed = 0;
    for _ in 0..MAX_ROUNDS_PER_PASS {
        let sample = fragment.sample_candidates(TTL_SAMPLE_SIZE, rng);
        if sample.is_empty() {
            break;
        }
        let idle: Vec<&Candidate> = sample
            .iter()
            .filter(|c| now_ms.saturating_sub(c.last_access_ms) >= max_idle_ms)
            .collect();
        for c in &idle {
            fragment.remove(&c.key);
        }
        removed += idle.len();
        if (idle.len() as f64) <= sample.len() as f64 * TTL_REPEAT_RATIO {
            break;
        }
    }
    removed
}

fn evict_lru<R: Rng + ?Sized>(
    fragment: &mut Fragment,
    settings: &EvictionSettings,
    rng: &mut R,
) -> usize {
    let samples = settings.lru_samples.max(1);
    let mut removed = 0;
    while settings.over_limit(fragment) && removed < MAX_LRU_EVICTIONS_PER_PASS {
        let candidates = fragment.sample_candidates(samples, rng);
        let Some(victim) = select_victim(&candidates) else {
            break;
        };
        let victim = victim.to_string();
        fragment.remove(&victim);
        removed += 1;
    }
    removed
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Spawn `workers` eviction tasks. Worker `i` owns the partitions where
/// `partition % workers == i`, so no two workers sweep the same partition.
pub fn spawn_eviction_workers(
    engine: Arc<StorageEngine>,
    workers: usize,
    every: Duration,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let workers = workers.max(1);
    (0..workers)
        .map(|worker| {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_worker(engine, worker, workers, every, cancel).await;
            })
        })
        .collect()
}

async fn run_worker(
    engine: Arc<StorageEngine>,
    worker: usize,
    workers: usize,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(worker, workers, "eviction worker started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(worker, "eviction worker stopping");
                break;
            }
            _ = ticker.tick() => {
                let report = run_pass(&engine, worker, workers).await;
                if report.total() > 0 {
                    report.record();
                    debug!(
                        worker,
                        expired = report.expired,
                        idle = report.idle,
                        lru = report.lru,
                        "eviction pass"
                    );
                }
            }
        }
    }
    info!(worker, "eviction worker stopped");
}

/// One pass over every partition assigned to `worker`.
pub async fn run_pass(engine: &StorageEngine, worker: usize, workers: usize) -> SweepReport {
    let mut report = SweepReport::default();
    let now_ms = dmap_common::unix_millis();
    for partition in 0..engine.partition_count() {
        if partition as usize % workers != worker {
            continue;
        }
        report.merge(engine.evict_partition(partition, now_ms).await);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StorageConfig;
    use crate::entry::Entry;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn candidate(key: &str, last_access_ms: u64) -> Candidate {
        Candidate {
            key: key.to_string(),
            last_access_ms,
        }
    }

    fn fill(fragment: &mut Fragment, n: usize, now: u64) {
        for i in 0..n {
            fragment.put(Entry::new(format!("k{:04}", i), vec![0u8; 16], 1, now + i as u64));
        }
    }

    #[test]
    fn test_select_victim_picks_least_recent() {
        let sample = vec![candidate("a", 30), candidate("b", 10), candidate("c", 20)];
        assert_eq!(select_victim(&sample), Some("b"));
        assert_eq!(select_victim(&[]), None);
    }

    #[test]
    fn test_select_victim_tie_breaks_on_key() {
        let sample = vec![candidate("z", 5), candidate("m", 5), candidate("q", 9)];
        assert_eq!(select_victim(&sample), Some("m"));
    }

    #[test]
    fn test_lru_sweep_enforces_max_keys() {
        let mut f = Fragment::new();
        fill(&mut f, 100, 1_000);
        let settings = EvictionSettings {
            policy: EvictionPolicy::Lru,
            max_keys: 60,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let report = sweep_fragment(&mut f, &settings, 5_000, &mut rng);
        assert_eq!(f.len(), 60);
        assert_eq!(report.lru, 40);
    }

    #[test]
    fn test_lru_sweep_prefers_cold_keys() {
        let mut f = Fragment::new();
        fill(&mut f, 50, 0);
        // Keep a hot set fresh.
        for i in 0..10 {
            f.get(&format!("k{:04}", i), 10_000, 0);
        }
        let settings = EvictionSettings {
            policy: EvictionPolicy::Lru,
            max_keys: 10,
            lru_samples: 50,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(11);
        sweep_fragment(&mut f, &settings, 10_000, &mut rng);
        assert_eq!(f.len(), 10);
        for i in 0..10 {
            assert!(f.peek(&format!("k{:04}", i)).is_some(), "hot key evicted");
        }
    }

    #[test]
    fn test_lru_sweep_enforces_max_inuse() {
        let mut f = Fragment::new();
        fill(&mut f, 20, 0);
        let per_entry = f.inuse() / 20;
        let settings = EvictionSettings {
            policy: EvictionPolicy::Lru,
            max_inuse: per_entry * 5,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        sweep_fragment(&mut f, &settings, 0, &mut rng);
        assert!(f.inuse() <= per_entry * 5);
        assert_eq!(f.len(), 5);
    }

    #[test]
    fn test_ttl_sweep_removes_expired_only() {
        let mut f = Fragment::new();
        for i in 0..30 {
            f.put(Entry::new(format!("t{}", i), vec![], 1, 0).with_expiry(Some(100)));
        }
        for i in 0..5 {
            f.put(Entry::new(format!("live{}", i), vec![], 1, 0).with_expiry(Some(10_000)));
        }
        f.put(Entry::new("forever".into(), vec![], 1, 0));

        let settings = EvictionSettings {
            policy: EvictionPolicy::Ttl,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(9);
        let report = sweep_fragment(&mut f, &settings, 500, &mut rng);
        assert!(report.expired > 0);
        for _ in 0..10 {
            sweep_fragment(&mut f, &settings, 500, &mut rng);
        }
        assert_eq!(f.len(), 6);
        assert!(f.peek("forever").is_some());
    }

    #[test]
    fn test_policy_none_still_removes_expired_entries() {
        let mut f = Fragment::new();
        f.put(Entry::new("t".into(), vec![], 1, 0).with_expiry(Some(1)));
        f.put(Entry::new("kept".into(), vec![], 1, 0));
        let mut rng = StdRng::seed_from_u64(1);
        let report = sweep_fragment(&mut f, &EvictionSettings::default(), 100, &mut rng);
        assert_eq!(report.expired, 1);
        assert_eq!(report.lru, 0);
        assert_eq!(f.len(), 1);
        assert!(f.peek("kept").is_some());
    }

    #[test]
    fn test_idle_sweep_applies_without_policy() {
        let mut f = Fragment::new();
        fill(&mut f, 10, 0);
        f.get("k0000", 900, 0);
        let settings = EvictionSettings {
            max_idle_ms: 500,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(2);
        let report = sweep_fragment(&mut f, &settings, 1_000, &mut rng);
        assert_eq!(report.idle, 9);
        assert_eq!(f.len(), 1);
        assert!(f.peek("k0000").is_some());
    }

    #[tokio::test]
    async fn test_workers_cover_every_partition() {
        let mut config = StorageConfig::new(4);
        config.defaults.policy = EvictionPolicy::Ttl;
        let engine = Arc::new(StorageEngine::new(config));
        for p in 0..4 {
            let e = Entry::new(format!("k{}", p), vec![], 1, 0).with_expiry(Some(1));
            engine.put(p, "m", e).await;
        }

        let cancel = CancellationToken::new();
        let handles =
            spawn_eviction_workers(engine.clone(), 2, Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(engine.partitions_with_data().await.is_empty());
    }
}
