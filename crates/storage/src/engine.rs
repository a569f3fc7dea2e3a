//! Storage engine: one store per partition, one fragment per map inside it.
//!
//! Each partition sits behind its own lock so unrelated partitions never
//! contend. Maps have no storage of their own beyond the fragments created
//! on first write.

use crate::entry::Entry;
use crate::eviction::{sweep_fragment, EvictionSettings, SweepReport};
use crate::fragment::Fragment;
use dmap_common::PartitionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub partition_count: u64,
    /// Settings for maps without an override.
    pub defaults: EvictionSettings,
    /// Fully resolved settings per map name.
    pub overrides: HashMap<String, EvictionSettings>,
}

impl StorageConfig {
    pub fn new(partition_count: u64) -> Self {
        Self {
            partition_count,
            defaults: EvictionSettings::default(),
            overrides: HashMap::new(),
        }
    }

    pub fn settings_for(&self, dmap: &str) -> &EvictionSettings {
        self.overrides.get(dmap).unwrap_or(&self.defaults)
    }
}

/// All entries of one map within one partition, as shipped during migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentData {
    pub dmap: String,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub partitions: usize,
    pub fragments: usize,
    pub keys: usize,
    pub inuse: usize,
}

#[derive(Debug, Default)]
struct PartitionStore {
    fragments: HashMap<String, Fragment>,
}

impl PartitionStore {
    fn fragment_mut(&mut self, dmap: &str) -> &mut Fragment {
        self.fragments.entry(dmap.to_string()).or_default()
    }

    fn key_count(&self) -> usize {
        self.fragments.values().map(Fragment::len).sum()
    }
}

pub struct StorageEngine {
    config: StorageConfig,
    partitions: Vec<RwLock<PartitionStore>>,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("partition_count", &self.config.partition_count)
            .finish_non_exhaustive()
    }
}

impl StorageEngine {
    pub fn new(config: StorageConfig) -> Self {
        let count = config.partition_count.max(1) as usize;
        let partitions = (0..count)
            .map(|_| RwLock::new(PartitionStore::default()))
            .collect();
        Self { config, partitions }
    }

    pub fn partition_count(&self) -> u64 {
        self.partitions.len() as u64
    }

    pub fn settings_for(&self, dmap: &str) -> &EvictionSettings {
        self.config.settings_for(dmap)
    }

    fn store(&self, partition: PartitionId) -> &RwLock<PartitionStore> {
        debug_assert!(partition < self.partition_count());
        &self.partitions[(partition % self.partition_count()) as usize]
    }

    /// Live entry for `key`: expired or idle entries read as absent.
    pub async fn get(&self, partition: PartitionId, dmap: &str, key: &str) -> Option<Entry> {
        let max_idle_ms = self.settings_for(dmap).max_idle_ms;
        let store = self.store(partition).read().await;
        store
            .fragments
            .get(dmap)?
            .get(key, dmap_common::unix_millis(), max_idle_ms)
    }

    /// Store a replicated entry unless the local copy is newer.
    pub async fn put(&self, partition: PartitionId, dmap: &str, entry: Entry) -> bool {
        let mut store = self.store(partition).write().await;
        store.fragment_mut(dmap).put(entry)
    }

    /// Write `value` as the next version of `key`. Used by the primary,
    /// which is the only node that assigns versions.
    ///
    /// The new version is `max(previous + 1, now_micros)`, so versions keep
    /// increasing across deletes and primary changes as long as clocks are
    /// roughly in sync. Returns the stored entry and the previous live one.
    pub async fn put_versioned(
        &self,
        partition: PartitionId,
        dmap: &str,
        key: &str,
        value: Vec<u8>,
        expires_at_ms: Option<u64>,
    ) -> (Entry, Option<Entry>) {
        let now_ms = dmap_common::unix_millis();
        let max_idle_ms = self.settings_for(dmap).max_idle_ms;
        let mut store = self.store(partition).write().await;
        let fragment = store.fragment_mut(dmap);

        let stored = fragment.peek(key);
        let previous_version = stored.as_ref().map_or(0, |e| e.version);
        let previous = stored.filter(|e| !e.is_expired(now_ms) && !e.is_idle(now_ms, max_idle_ms));

        let version = (previous_version + 1).max(dmap_common::unix_micros());
        let entry = Entry::new(key.to_string(), value, version, now_ms).with_expiry(expires_at_ms);
        fragment.insert(entry.clone());
        (entry, previous)
    }

    /// Remove `key`, returning the removed entry if it was live.
    pub async fn delete(&self, partition: PartitionId, dmap: &str, key: &str) -> Option<Entry> {
        let now_ms = dmap_common::unix_millis();
        let mut store = self.store(partition).write().await;
        let fragment = store.fragments.get_mut(dmap)?;
        let removed = fragment.remove(key);
        if fragment.is_empty() {
            store.fragments.remove(dmap);
        }
        removed.filter(|e| !e.is_expired(now_ms))
    }

    /// Drop every fragment of `dmap`. Returns the number of keys removed.
    pub async fn destroy_dmap(&self, dmap: &str) -> usize {
        let mut removed = 0;
        for store in &self.partitions {
            if let Some(fragment) = store.write().await.fragments.remove(dmap) {
                removed += fragment.len();
            }
        }
        removed
    }

    /// Copy of everything held for `partition`.
    pub async fn export_partition(&self, partition: PartitionId) -> Vec<FragmentData> {
        let store = self.store(partition).read().await;
        store
            .fragments
            .iter()
            .map(|(dmap, fragment)| FragmentData {
                dmap: dmap.clone(),
                entries: fragment.export(),
            })
            .collect()
    }

    /// Merge migrated fragments. Returns the number of entries stored.
    pub async fn import(&self, partition: PartitionId, data: Vec<FragmentData>) -> usize {
        let mut store = self.store(partition).write().await;
        let mut stored = 0;
        for fragment_data in data {
            let fragment = store.fragment_mut(&fragment_data.dmap);
            for entry in fragment_data.entries {
                if fragment.put(entry) {
                    stored += 1;
                }
            }
            if store
                .fragments
                .get(&fragment_data.dmap)
                .is_some_and(Fragment::is_empty)
            {
                store.fragments.remove(&fragment_data.dmap);
            }
        }
        stored
    }

    /// Forget `partition` entirely. Returns the number of keys dropped.
    pub async fn drop_partition(&self, partition: PartitionId) -> usize {
        let mut store = self.store(partition).write().await;
        let dropped = store.key_count();
        store.fragments.clear();
        dropped
    }

    pub async fn key_count(&self, partition: PartitionId) -> usize {
        self.store(partition).read().await.key_count()
    }

    /// Partitions holding at least one entry.
    pub async fn partitions_with_data(&self) -> Vec<PartitionId> {
        let mut result = Vec::new();
        for (partition, store) in self.partitions.iter().enumerate() {
            if !store.read().await.fragments.is_empty() {
                result.push(partition as PartitionId);
            }
        }
        result
    }

    pub async fn stats(&self) -> StorageStats {
        let mut stats = StorageStats::default();
        for store in &self.partitions {
            let store = store.read().await;
            if store.fragments.is_empty() {
                continue;
            }
            stats.partitions += 1;
            stats.fragments += store.fragments.len();
            for fragment in store.fragments.values() {
                stats.keys += fragment.len();
                stats.inuse += fragment.inuse();
            }
        }
        stats
    }

    /// Run one eviction pass over every fragment of `partition` and drop
    /// fragments left empty.
    pub async fn evict_partition(&self, partition: PartitionId, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();
        let mut store = self.store(partition).write().await;
        let mut rng = rand::thread_rng();
        for (dmap, fragment) in store.fragments.iter_mut() {
            let settings = self.config.settings_for(dmap);
            report.merge(sweep_fragment(fragment, settings, now_ms, &mut rng));
        }
        store.fragments.retain(|_, fragment| !fragment.is_empty());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::EvictionPolicy;

    fn engine() -> StorageEngine {
        StorageEngine::new(StorageConfig::new(8))
    }

    fn entry(key: &str, value: &str, version: u64) -> Entry {
        Entry::new(key.to_string(), value.as_bytes().to_vec(), version, 1)
    }

    #[tokio::test]
    async fn test_put_get_isolated_by_dmap() {
        let engine = engine();
        engine.put(3, "users", entry("k", "alice", 1)).await;
        engine.put(3, "orders", entry("k", "42", 1)).await;

        assert_eq!(engine.get(3, "users", "k").await.unwrap().value, b"alice");
        assert_eq!(engine.get(3, "orders", "k").await.unwrap().value, b"42");
        assert!(engine.get(3, "missing", "k").await.is_none());
        assert!(engine.get(4, "users", "k").await.is_none());
    }

    #[tokio::test]
    async fn test_put_versioned_is_strictly_increasing() {
        let engine = engine();
        let (first, prev) = engine.put_versioned(0, "m", "k", b"a".to_vec(), None).await;
        assert!(prev.is_none());
        let (second, prev) = engine.put_versioned(0, "m", "k", b"b".to_vec(), None).await;
        assert!(second.version > first.version);
        assert_eq!(prev.unwrap().value, b"a");

        // A replica that already holds a far-future version still advances.
        engine.put(0, "m", entry("k", "future", u64::MAX / 2)).await;
        let (third, _) = engine.put_versioned(0, "m", "k", b"c".to_vec(), None).await;
        assert_eq!(third.version, u64::MAX / 2 + 1);
    }

    #[tokio::test]
    async fn test_put_versioned_hides_expired_previous() {
        let engine = engine();
        engine
            .put(0, "m", entry("k", "old", 5).with_expiry(Some(1)))
            .await;
        let (stored, prev) = engine.put_versioned(0, "m", "k", b"new".to_vec(), None).await;
        assert!(prev.is_none());
        assert!(stored.version > 5);
    }

    #[tokio::test]
    async fn test_replicated_put_respects_versions() {
        let engine = engine();
        assert!(engine.put(1, "m", entry("k", "v2", 2)).await);
        assert!(!engine.put(1, "m", entry("k", "v1", 1)).await);
        assert_eq!(engine.get(1, "m", "k").await.unwrap().value, b"v2");
    }

    #[tokio::test]
    async fn test_delete_drops_empty_fragment() {
        let engine = engine();
        engine.put(2, "m", entry("k", "v", 1)).await;
        assert!(engine.delete(2, "m", "k").await.is_some());
        assert!(engine.delete(2, "m", "k").await.is_none());
        assert!(engine.partitions_with_data().await.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_dmap_spans_partitions() {
        let engine = engine();
        for p in 0..8 {
            engine.put(p, "gone", entry(&format!("k{}", p), "v", 1)).await;
            engine.put(p, "kept", entry(&format!("k{}", p), "v", 1)).await;
        }
        assert_eq!(engine.destroy_dmap("gone").await, 8);
        let stats = engine.stats().await;
        assert_eq!(stats.keys, 8);
        assert_eq!(stats.fragments, 8);
    }

    #[tokio::test]
    async fn test_export_import_drop() {
        let source = engine();
        let target = engine();
        for i in 0..20 {
            source.put(5, "m", entry(&format!("k{}", i), "v", 1)).await;
        }
        source.put(5, "other", entry("x", "y", 1)).await;

        let data = source.export_partition(5).await;
        assert_eq!(data.len(), 2);
        assert_eq!(target.import(5, data.clone()).await, 21);
        assert_eq!(target.import(5, data).await, 0, "re-import is idempotent");
        assert_eq!(target.key_count(5).await, 21);

        assert_eq!(source.drop_partition(5).await, 21);
        assert_eq!(source.key_count(5).await, 0);
    }

    #[tokio::test]
    async fn test_evict_partition_uses_dmap_settings() {
        let mut config = StorageConfig::new(4);
        config.overrides.insert(
            "small".into(),
            EvictionSettings {
                policy: EvictionPolicy::Lru,
                max_keys: 3,
                ..Default::default()
            },
        );
        let engine = StorageEngine::new(config);
        for i in 0..10 {
            engine.put(0, "small", entry(&format!("k{}", i), "v", 1)).await;
            engine.put(0, "big", entry(&format!("k{}", i), "v", 1)).await;
        }
        let report = engine.evict_partition(0, 100).await;
        assert_eq!(report.lru, 7);
        assert_eq!(engine.key_count(0).await, 13);
    }

    #[tokio::test]
    async fn test_evict_partition_drops_emptied_fragments() {
        let mut config = StorageConfig::new(2);
        config.defaults.policy = EvictionPolicy::Ttl;
        let engine = StorageEngine::new(config);
        engine
            .put(1, "m", entry("k", "v", 1).with_expiry(Some(10)))
            .await;
        let report = engine.evict_partition(1, 50).await;
        assert_eq!(report.expired, 1);
        assert!(engine.partitions_with_data().await.is_empty());
    }

    #[tokio::test]
    async fn test_default_config_reclaims_expired_entries() {
        let engine = engine();
        engine
            .put(0, "m", entry("gone", "v", 1).with_expiry(Some(10)))
            .await;
        engine.put(0, "m", entry("kept", "v", 1)).await;

        let report = engine.evict_partition(0, dmap_common::unix_millis()).await;
        assert_eq!(report.expired, 1);
        assert_eq!(engine.key_count(0).await, 1);
        assert_eq!(engine.stats().await.keys, 1);
    }
}
