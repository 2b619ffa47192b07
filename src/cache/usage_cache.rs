//! Usage snapshot cache with TTL expiry and LRU eviction.
//!
//! Keyed by `(identity, feature)`. Entries expire after a short TTL (15 s by
//! default) and are evicted least-recently-used when the cache reaches
//! capacity. Nothing is persisted: the counter store is the source of truth
//! and a cold start simply means a few extra ledger reads.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::identity::Identity;
use crate::ledger::{Feature, UsageSnapshot};

/// A single cached snapshot.
#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: UsageSnapshot,
    stored_at: Instant,
    accessed_at: Instant,
    hit_count: u32,
}

type CacheKey = (Identity, Feature);

struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Bumped by every write that reflects a ledger mutation.
    generation: u64,
}

/// In-memory usage snapshot cache.
///
/// Read-through fills go through [`UsageCache::fill`] with the generation
/// observed before the ledger read, so a check that raced a `use` can never
/// replace the post-use snapshot with its older view.
pub struct UsageCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    max_entries: usize,
}

impl UsageCache {
    /// Default freshness window.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

    /// Create a cache with the given TTL and capacity.
    ///
    /// `max_entries` is clamped to a minimum of 1.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                generation: 0,
            }),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Look up a fresh snapshot. Expired entries are removed and reported as
    /// a miss.
    pub fn get(&self, identity: &Identity, feature: Feature) -> Option<UsageSnapshot> {
        let key = (identity.clone(), feature);
        let mut state = self.state.lock().expect("usage cache lock poisoned");
        let fresh = state
            .entries
            .get(&key)
            .map(|e| e.stored_at.elapsed() < self.ttl)?;
        if !fresh {
            debug!(identity = %identity, feature = %feature, "Usage cache entry expired");
            state.entries.remove(&key);
            return None;
        }
        let entry = state.entries.get_mut(&key)?;
        entry.accessed_at = Instant::now();
        entry.hit_count = entry.hit_count.saturating_add(1);
        Some(entry.snapshot.clone())
    }

    /// Current write generation. Take it before reading the ledger and hand
    /// it to [`Self::fill`].
    pub fn generation(&self) -> u64 {
        self.state.lock().expect("usage cache lock poisoned").generation
    }

    /// Store the result of a mutation, replacing any previous entry for the
    /// key outright.
    pub fn put(&self, identity: &Identity, feature: Feature, snapshot: UsageSnapshot) {
        let mut state = self.state.lock().expect("usage cache lock poisoned");
        state.generation = state.generation.wrapping_add(1);
        self.insert(&mut state, (identity.clone(), feature), snapshot);
    }

    /// Store a read-through result unless a write happened since
    /// `seen_generation`. Returns whether the snapshot was stored.
    pub fn fill(
        &self,
        identity: &Identity,
        feature: Feature,
        snapshot: UsageSnapshot,
        seen_generation: u64,
    ) -> bool {
        let mut state = self.state.lock().expect("usage cache lock poisoned");
        if state.generation != seen_generation {
            debug!(identity = %identity, feature = %feature, "Skipping fill after concurrent write");
            return false;
        }
        self.insert(&mut state, (identity.clone(), feature), snapshot);
        true
    }

    /// Insert, sweeping expired entries and then LRU entries only when the
    /// cache is full.
    fn insert(&self, state: &mut CacheState, key: CacheKey, snapshot: UsageSnapshot) {
        let now = Instant::now();
        let entries = &mut state.entries;
        entries.remove(&key);

        if entries.len() >= self.max_entries {
            let ttl = self.ttl;
            entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        }
        while entries.len() >= self.max_entries {
            let Some(lru) = entries
                .iter()
                .min_by_key(|(_, e)| e.accessed_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            debug!(identity = %lru.0, feature = %lru.1, "Evicting LRU usage cache entry");
            entries.remove(&lru);
        }

        entries.insert(
            key,
            CacheEntry {
                snapshot,
                stored_at: now,
                accessed_at: now,
                hit_count: 0,
            },
        );
    }

    /// Drop the entry for one key.
    pub fn invalidate(&self, identity: &Identity, feature: Feature) {
        let mut state = self.state.lock().expect("usage cache lock poisoned");
        state.generation = state.generation.wrapping_add(1);
        state.entries.remove(&(identity.clone(), feature));
    }

    /// Remove all entries.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("usage cache lock poisoned");
        state.generation = state.generation.wrapping_add(1);
        state.entries.clear();
    }

    /// Return aggregate statistics about the cache.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("usage cache lock poisoned");
        CacheStats {
            total_entries: state.entries.len(),
            total_hits: state.entries.values().map(|e| u64::from(e.hit_count)).sum(),
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("usage cache lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries currently in the cache.
    pub total_entries: usize,
    /// Cumulative hits across live entries.
    pub total_hits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::UsageDay;
    use crate::identity::DeviceId;
    use chrono::Utc;

    fn device(id: &str) -> Identity {
        Identity::Device(DeviceId::new(id).unwrap())
    }

    fn snapshot(used: u32) -> UsageSnapshot {
        UsageSnapshot {
            used,
            remaining: Some(5 - used),
            cap: 5,
            is_premium: false,
            day: UsageDay::parse("2026-03-01").unwrap(),
            resets_at: Utc::now(),
        }
    }

    fn test_cache() -> UsageCache {
        UsageCache::new(Duration::from_secs(3600), 3)
    }

    #[test]
    fn test_cache_hit_miss() {
        let cache = test_cache();
        let me = device("a");
        assert!(cache.get(&me, Feature::Solve).is_none());
        cache.put(&me, Feature::Solve, snapshot(1));
        assert_eq!(cache.get(&me, Feature::Solve), Some(snapshot(1)));
        assert!(cache.get(&me, Feature::Quiz).is_none(), "features are separate keys");
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let cache = UsageCache::new(Duration::ZERO, 3);
        let me = device("a");
        cache.put(&me, Feature::Solve, snapshot(1));
        assert!(cache.get(&me, Feature::Solve).is_none());
        assert!(cache.is_empty(), "expired entry should be removed on read");
    }

    #[test]
    fn test_put_overwrites_not_merges() {
        let cache = test_cache();
        let me = device("a");
        cache.put(&me, Feature::Solve, snapshot(1));
        let _ = cache.get(&me, Feature::Solve);
        cache.put(&me, Feature::Solve, snapshot(3));
        assert_eq!(cache.get(&me, Feature::Solve).unwrap().used, 3);
        assert_eq!(cache.stats().total_hits, 1, "hit count restarts with the new entry");
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = test_cache(); // max 3 entries
        for id in ["a", "b", "c"] {
            cache.put(&device(id), Feature::Solve, snapshot(0));
        }
        std::thread::sleep(Duration::from_millis(2));
        // Touch a and c so b is least recently used.
        let _ = cache.get(&device("a"), Feature::Solve);
        let _ = cache.get(&device("c"), Feature::Solve);

        cache.put(&device("d"), Feature::Solve, snapshot(0));
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&device("b"), Feature::Solve).is_none());
        assert!(cache.get(&device("a"), Feature::Solve).is_some());
        assert!(cache.get(&device("d"), Feature::Solve).is_some());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = test_cache();
        cache.put(&device("a"), Feature::Solve, snapshot(0));
        cache.put(&device("b"), Feature::Solve, snapshot(0));
        cache.invalidate(&device("a"), Feature::Solve);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_max_entries_zero_clamped() {
        let cache = UsageCache::new(Duration::from_secs(60), 0);
        cache.put(&device("a"), Feature::Solve, snapshot(0));
        cache.put(&device("b"), Feature::Solve, snapshot(0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fill_skipped_after_concurrent_write() {
        let cache = test_cache();
        let me = device("a");
        let seen = cache.generation();
        cache.put(&me, Feature::Solve, snapshot(1));
        assert!(!cache.fill(&me, Feature::Solve, snapshot(0), seen));
        assert_eq!(cache.get(&me, Feature::Solve).unwrap().used, 1);

        let seen = cache.generation();
        assert!(cache.fill(&device("b"), Feature::Solve, snapshot(0), seen));
    }

    #[test]
    fn test_fill_skipped_after_invalidate() {
        let cache = test_cache();
        let me = device("a");
        let seen = cache.generation();
        cache.invalidate(&me, Feature::Solve);
        assert!(!cache.fill(&me, Feature::Solve, snapshot(0), seen));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entries_kept_until_full() {
        let cache = UsageCache::new(Duration::from_millis(100), 3);
        cache.put(&device("a"), Feature::Solve, snapshot(0));
        cache.put(&device("b"), Feature::Solve, snapshot(0));
        std::thread::sleep(Duration::from_millis(150));
        cache.put(&device("c"), Feature::Solve, snapshot(0));
        assert_eq!(cache.len(), 3, "no sweep below capacity");

        cache.put(&device("d"), Feature::Solve, snapshot(0));
        assert_eq!(cache.len(), 2, "sweep at capacity drops both expired entries");
    }

    #[test]
    fn test_cache_stats() {
        let cache = test_cache();
        cache.put(&device("a"), Feature::Solve, snapshot(0));
        cache.put(&device("b"), Feature::Solve, snapshot(0));
        let _ = cache.get(&device("a"), Feature::Solve);
        let _ = cache.get(&device("a"), Feature::Solve);
        let _ = cache.get(&device("b"), Feature::Solve);
        assert_eq!(
            cache.stats(),
            CacheStats {
                total_entries: 2,
                total_hits: 3
            }
        );
    }
}
