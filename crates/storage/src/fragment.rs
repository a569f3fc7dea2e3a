//! In-memory storage for one map within one partition.
//!
//! Besides the key → entry map, a fragment keeps two dense key sets (all
//! keys, keys with a TTL) that support O(1) insert, remove and uniform
//! random sampling. Eviction draws its candidates from them instead of
//! maintaining a global LRU order.

use crate::entry::Entry;
use crate::eviction::Candidate;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// SampleSet
// ---------------------------------------------------------------------------

/// A set of keys with O(1) random access.
#[derive(Debug, Default)]
pub struct SampleSet {
    keys: Vec<String>,
    index: HashMap<String, usize>,
}

impl SampleSet {
    pub fn insert(&mut self, key: &str) {
        if self.index.contains_key(key) {
            return;
        }
        self.index.insert(key.to_string(), self.keys.len());
        self.keys.push(key.to_string());
    }

    pub fn remove(&mut self, key: &str) {
        let Some(pos) = self.index.remove(key) else {
            return;
        };
        self.keys.swap_remove(pos);
        if let Some(moved) = self.keys.get(pos) {
            self.index.insert(moved.clone(), pos);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Up to `n` distinct keys chosen uniformly at random.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<&str> {
        if n >= self.keys.len() {
            return self.keys.iter().map(String::as_str).collect();
        }
        rand::seq::index::sample(rng, self.keys.len(), n)
            .into_iter()
            .map(|i| self.keys[i].as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Fragment
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Slot {
    entry: Entry,
    /// Updated on reads, which only hold a shared reference.
    last_access_ms: AtomicU64,
}

impl Slot {
    fn snapshot(&self) -> Entry {
        let mut entry = self.entry.clone();
        entry.last_access_ms = self.last_access_ms.load(Ordering::Relaxed);
        entry
    }
}

#[derive(Debug, Default)]
pub struct Fragment {
    slots: HashMap<String, Slot>,
    keys: SampleSet,
    ttl_keys: SampleSet,
    inuse: usize,
}

impl Fragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Approximate bytes held.
    pub fn inuse(&self) -> usize {
        self.inuse
    }

    pub fn ttl_key_count(&self) -> usize {
        self.ttl_keys.len()
    }

    /// Read a live entry and refresh its access time. Expired and idle
    /// entries read as absent; the sweep removes them later.
    pub fn get(&self, key: &str, now_ms: u64, max_idle_ms: u64) -> Option<Entry> {
        let slot = self.slots.get(key)?;
        let mut entry = slot.snapshot();
        if entry.is_expired(now_ms) || entry.is_idle(now_ms, max_idle_ms) {
            return None;
        }
        slot.last_access_ms.fetch_max(now_ms, Ordering::Relaxed);
        entry.last_access_ms = entry.last_access_ms.max(now_ms);
        Some(entry)
    }

    /// The stored entry as-is, without expiry checks or touching it.
    pub fn peek(&self, key: &str) -> Option<Entry> {
        self.slots.get(key).map(Slot::snapshot)
    }

    /// Store `entry` unless the current one supersedes it. Returns whether
    /// the entry was stored.
    pub fn put(&mut self, entry: Entry) -> bool {
        if let Some(existing) = self.slots.get(&entry.key) {
            if !entry.supersedes(&existing.entry) {
                return false;
            }
        }
        self.insert(entry);
        true
    }

    /// Store `entry` unconditionally.
    pub fn insert(&mut self, entry: Entry) {
        self.remove(&entry.key);
        let key = entry.key.clone();
        self.inuse += entry.approximate_size();
        self.keys.insert(&key);
        if entry.expires_at_ms.is_some() {
            self.ttl_keys.insert(&key);
        }
        let last_access = AtomicU64::new(entry.last_access_ms);
        self.slots.insert(
            key,
            Slot {
                entry,
                last_access_ms: last_access,
            },
        );
    }

    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        let slot = self.slots.remove(key)?;
        self.keys.remove(key);
        self.ttl_keys.remove(key);
        self.inuse = self.inuse.saturating_sub(slot.entry.approximate_size());
        Some(slot.snapshot())
    }

    /// Random keys drawn from the whole fragment.
    pub fn sample_keys<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<String> {
        self.keys
            .sample(n, rng)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Random keys drawn from entries carrying a TTL.
    pub fn sample_ttl_keys<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<String> {
        self.ttl_keys
            .sample(n, rng)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Eviction candidates for `n` random keys.
    pub fn sample_candidates<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<Candidate> {
        self.keys
            .sample(n, rng)
            .into_iter()
            .filter_map(|key| {
                self.slots.get(key).map(|slot| Candidate {
                    key: key.to_string(),
                    last_access_ms: slot.last_access_ms.load(Ordering::Relaxed),
                })
            })
            .collect()
    }

    /// Copy of every entry, for migration.
    pub fn export(&self) -> Vec<Entry> {
        self.slots.values().map(Slot::snapshot).collect()
    }
}
