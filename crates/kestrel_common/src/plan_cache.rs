//! Versioned statement cache for ad-hoc plans.
//!
//! Compiled statements are only valid against the catalog version they were
//! planned under, so the cache is an explicit `(catalog version → bounded LRU)`
//! mapping. A catalog update calls `clear_version` for the obsolete version;
//! there is no process-wide singleton — each execution site owns its instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Upper bound on cached statements per catalog version.
pub const MAX_ENTRIES_PER_VERSION: usize = 100;

/// Hit/miss/eviction counters, snapshotted for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Entry<T> {
    value: Arc<T>,
    last_used: u64,
}

struct VersionCache<T> {
    entries: HashMap<String, Entry<T>>,
    tick: u64,
}

impl<T> VersionCache<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            tick: 0,
        }
    }
}

struct Inner<T> {
    versions: HashMap<u64, VersionCache<T>>,
    stats: PlanCacheStats,
}

/// Bounded per-catalog-version LRU cache of compiled statements, keyed by
/// statement text.
pub struct VersionedPlanCache<T> {
    max_entries: usize,
    inner: RwLock<Inner<T>>,
}

impl<T> VersionedPlanCache<T> {
    pub fn new() -> Self {
        Self::with_max_entries(MAX_ENTRIES_PER_VERSION)
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: RwLock::new(Inner {
                versions: HashMap::new(),
                stats: PlanCacheStats::default(),
            }),
        }
    }

    /// Look up a statement under a catalog version, refreshing its recency.
    pub fn get(&self, catalog_version: u64, sql: &str) -> Option<Arc<T>> {
        let mut inner = self.inner.write();
        let Inner { versions, stats } = &mut *inner;
        let found = versions.get_mut(&catalog_version).and_then(|cache| {
            cache.tick += 1;
            let tick = cache.tick;
            cache.entries.get_mut(sql).map(|e| {
                e.last_used = tick;
                Arc::clone(&e.value)
            })
        });
        match found {
            Some(v) => {
                stats.hits += 1;
                Some(v)
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Insert a statement, evicting the least recently used entry when the
    /// version's cache is full. Re-inserting an existing key refreshes both
    /// the value and its recency.
    pub fn insert(&self, catalog_version: u64, sql: impl Into<String>, value: Arc<T>) {
        let sql = sql.into();
        let mut inner = self.inner.write();
        let Inner { versions, stats } = &mut *inner;
        let cache = versions
            .entry(catalog_version)
            .or_insert_with(VersionCache::new);
        cache.tick += 1;
        let tick = cache.tick;
        if !cache.entries.contains_key(&sql) && cache.entries.len() >= self.max_entries {
            if let Some(lru_key) = cache
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                cache.entries.remove(&lru_key);
                stats.evictions += 1;
            }
        }
        cache.entries.insert(
            sql,
            Entry {
                value,
                last_used: tick,
            },
        );
    }

    /// Drop every statement planned under the given catalog version.
    pub fn clear_version(&self, catalog_version: u64) {
        let removed = self.inner.write().versions.remove(&catalog_version);
        if let Some(cache) = removed {
            tracing::debug!(
                catalog_version,
                entries = cache.entries.len(),
                "plan cache version cleared"
            );
        }
    }

    /// Number of statements cached under a version.
    pub fn len(&self, catalog_version: u64) -> usize {
        self.inner
            .read()
            .versions
            .get(&catalog_version)
            .map_or(0, |c| c.entries.len())
    }

    pub fn is_empty(&self, catalog_version: u64) -> bool {
        self.len(catalog_version) == 0
    }

    pub fn stats(&self) -> PlanCacheStats {
        self.inner.read().stats
    }
}

impl<T> Default for VersionedPlanCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_miss_then_hit() {
        let cache: VersionedPlanCache<String> = VersionedPlanCache::new();
        assert!(cache.get(1, "select 1").is_none());
        cache.insert(1, "select 1", Arc::new("plan-a".to_string()));
        let hit = cache.get(1, "select 1").unwrap();
        assert_eq!(*hit, "plan-a");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_versions_are_isolated() {
        let cache: VersionedPlanCache<u32> = VersionedPlanCache::new();
        cache.insert(1, "select 1", Arc::new(10));
        assert!(cache.get(2, "select 1").is_none());
        cache.insert(2, "select 1", Arc::new(20));
        assert_eq!(*cache.get(1, "select 1").unwrap(), 10);
        assert_eq!(*cache.get(2, "select 1").unwrap(), 20);
    }

    #[test]
    fn test_clear_version_removes_only_that_version() {
        let cache: VersionedPlanCache<u32> = VersionedPlanCache::new();
        cache.insert(1, "a", Arc::new(1));
        cache.insert(2, "a", Arc::new(2));
        cache.clear_version(1);
        assert!(cache.is_empty(1));
        assert_eq!(cache.len(2), 1);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache: VersionedPlanCache<u32> = VersionedPlanCache::with_max_entries(2);
        cache.insert(1, "a", Arc::new(1));
        cache.insert(1, "b", Arc::new(2));
        // Touch "a" so "b" becomes the LRU entry.
        assert!(cache.get(1, "a").is_some());
        cache.insert(1, "c", Arc::new(3));
        assert!(cache.get(1, "b").is_none());
        assert!(cache.get(1, "a").is_some());
        assert!(cache.get(1, "c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_reinsert_refreshes_value_without_eviction() {
        let cache: VersionedPlanCache<u32> = VersionedPlanCache::with_max_entries(2);
        cache.insert(1, "a", Arc::new(1));
        cache.insert(1, "b", Arc::new(2));
        cache.insert(1, "a", Arc::new(99));
        assert_eq!(cache.len(1), 2);
        assert_eq!(*cache.get(1, "a").unwrap(), 99);
        assert_eq!(cache.stats().evictions, 0);
    }
}
