use std::{
    mem,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use common::block::{BlockDesc, BlockMeta};
use lru::LruCache;
use parking_lot::Mutex;
use ulid::Ulid;

/// LRU cache for parsed block metadata, keyed by block ID. A fetcher keeps its
/// own per-instance snapshot; `MetaCache` is the tier shared between fetcher
/// instances.
///
/// Only metadata with the configured minimum compaction level and number of
/// sources is admitted, biasing retention toward expensive-to-recompute,
/// long-lived blocks. A threshold of zero disables that check.
pub struct MetaCache {
    max_size: usize,
    min_compaction_level: i32,
    min_sources: usize,

    lru: Mutex<LruCache<Ulid, Arc<BlockMeta>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub items: usize,
    /// Approximate (shallow) memory footprint of the cached entries,
    /// including key overhead.
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl MetaCache {
    /// Panics if `max_size` is zero; that is a configuration error.
    pub fn new(max_size: usize, min_compaction_level: i32, min_sources: usize) -> Self {
        let cap = NonZeroUsize::new(max_size).expect("meta cache max size must be positive");
        Self {
            max_size,
            min_compaction_level,
            min_sources,
            lru: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn put(&self, meta: &Arc<BlockMeta>) {
        if self.min_compaction_level > 0 && meta.compaction.level < self.min_compaction_level {
            return;
        }
        if self.min_sources > 0 && meta.compaction.sources.len() < self.min_sources {
            return;
        }
        self.lru.lock().put(meta.ulid, meta.clone());
    }

    pub fn get(&self, id: Ulid) -> Option<Arc<BlockMeta>> {
        match self.lru.lock().get(&id) {
            Some(meta) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(meta.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let lru = self.lru.lock();
        let mut items = 0;
        let mut bytes = 0;
        for (_, meta) in lru.iter() {
            items += 1;
            bytes += mem::size_of::<Ulid>(); // for a key
            bytes += meta_bytes_size(meta);
        }
        CacheStats {
            items,
            bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

pub fn meta_bytes_size(meta: &BlockMeta) -> usize {
    let mut size = mem::size_of::<BlockMeta>();
    size += meta.compaction.sources.len() * mem::size_of::<Ulid>();
    size += meta.compaction.parents.len() * mem::size_of::<BlockDesc>();
    for hint in meta.compaction.hints.iter().flatten() {
        size += mem::size_of::<String>() + hint.len();
    }
    size
}

#[cfg(test)]
mod tests {
    use common::block::Compaction;

    use super::*;

    fn meta(level: i32, sources: usize) -> Arc<BlockMeta> {
        let sources = (0..sources).map(|_| Ulid::new()).collect();
        Arc::new(BlockMeta {
            ulid: Ulid::new(),
            version: 1,
            min_time: 0,
            max_time: 1,
            compaction: Compaction {
                level,
                sources,
                parents: Vec::new(),
                hints: None,
                extra: serde_json::Map::new(),
            },
            extra: serde_json::Map::new(),
        })
    }

    #[test]
    #[should_panic(expected = "must be positive")]
    fn zero_capacity_panics() {
        MetaCache::new(0, 0, 0);
    }

    #[test]
    fn admission_thresholds() {
        let cache = MetaCache::new(16, 2, 2);

        let shallow = meta(1, 4);
        cache.put(&shallow);
        assert!(cache.get(shallow.ulid).is_none());

        let few_sources = meta(3, 1);
        cache.put(&few_sources);
        assert!(cache.get(few_sources.ulid).is_none());

        let kept = meta(2, 2);
        cache.put(&kept);
        assert_eq!(cache.get(kept.ulid).as_ref(), Some(&kept));
    }

    #[test]
    fn zero_thresholds_admit_everything() {
        let cache = MetaCache::new(16, 0, 0);
        let m = meta(1, 0);
        cache.put(&m);
        assert!(cache.get(m.ulid).is_some());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = MetaCache::new(2, 0, 0);
        let a = meta(1, 1);
        let b = meta(1, 1);
        let c = meta(1, 1);

        cache.put(&a);
        cache.put(&b);
        // Touch `a` so `b` becomes the eviction candidate.
        assert!(cache.get(a.ulid).is_some());
        cache.put(&c);

        assert!(cache.get(a.ulid).is_some());
        assert!(cache.get(b.ulid).is_none());
        assert!(cache.get(c.ulid).is_some());
    }

    #[test]
    fn stats_track_hits_misses_and_size() {
        let cache = MetaCache::new(16, 0, 0);
        let m = meta(2, 3);
        cache.put(&m);

        assert!(cache.get(m.ulid).is_some());
        assert!(cache.get(Ulid::new()).is_none());

        let stats = cache.stats();
        assert_eq!(stats.items, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!(stats.bytes >= mem::size_of::<Ulid>() + meta_bytes_size(&m));
        assert_eq!(cache.max_size(), 16);
    }
}
