use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use async_trait::async_trait;
use common::{
    block::{self, BlockMeta, TSDB_VERSION_1},
    Store,
};
use futures::{
    future::{BoxFuture, WeakShared},
    FutureExt, StreamExt,
};
use parking_lot::Mutex;
use prometheus::Registry;
use tracing::{debug, info};
use ulid::Ulid;

use crate::{
    cache::MetaCache,
    disk_cache::DiskMetaCache,
    error::{FetchError, LoadMetaError, MultiError, SyncError},
    filters::MetadataFilter,
    metrics::{
        FetcherMetrics, CORRUPTED_META, FAILED_META, LOADED_META, LOOKBACK_EXCLUDED_META,
        MARKED_FOR_DELETION_META, NO_META,
    },
};

pub type BlockMetas = HashMap<Ulid, Arc<BlockMeta>>;
pub type PartialBlocks = HashMap<Ulid, Arc<LoadMetaError>>;

/// One fetch pass's outcome: all healthy block metadata plus the blocks that
/// were discovered but whose metadata is missing or corrupted.
///
/// Both maps are owned by the caller; the metadata values themselves are
/// shared and must not be modified.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub metas: BlockMetas,
    pub partial: PartialBlocks,
}

#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch(&self) -> Result<FetchResult, FetchError>;
}

#[derive(Debug, Clone)]
pub struct MetaFetcherConfig {
    /// Worker-pool size for concurrent meta.json loads.
    pub concurrency: usize,

    /// Root of the local meta.json cache. `None` disables disk caching.
    pub cache_dir: Option<PathBuf>,

    /// Blocks whose ID pre-dates `now - max_lookback` are skipped without
    /// loading. `None` disables time-based pruning.
    pub max_lookback: Option<Duration>,
}

impl Default for MetaFetcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 32,
            cache_dir: None,
            max_lookback: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NewMetaFetcherError {
    #[error("fetcher concurrency must be positive")]
    InvalidConcurrency,

    #[error("create meta cache dir: {0}")]
    CacheDir(#[from] std::io::Error),
}

type ScanOutput = Result<Arc<ScanResponse>, Arc<SyncError>>;
type ScanFuture = BoxFuture<'static, ScanOutput>;

/// Synchronizes filtered block metadata from the object store with the local
/// state. Cloning is cheap; clones share caches and the single-flight slot.
#[derive(Clone)]
pub struct MetaFetcher {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    concurrency: usize,
    max_lookback: Option<Duration>,
    filters: Vec<Arc<dyn MetadataFilter>>,
    metrics: FetcherMetrics,

    disk_cache: Option<DiskMetaCache>,

    /// Cache reused between fetcher instances.
    meta_cache: Option<Arc<MetaCache>>,

    /// Snapshot of the last complete fetch, replaced wholesale.
    cached: Mutex<Arc<BlockMetas>>,

    /// The in-flight scan, if any. Concurrent callers attach to it instead of
    /// starting their own.
    inflight: Mutex<Option<WeakShared<ScanFuture>>>,
}

/// Result of one shared scan, fanned out to every caller that coalesced onto
/// it. If `meta_errs` is non-empty the view is incomplete: some metas failed
/// to load.
#[derive(Default)]
struct ScanResponse {
    metas: BlockMetas,
    partial: PartialBlocks,
    meta_errs: MultiError,

    // Blocks not returned, by reason.
    no_metas: u64,
    corrupted: u64,
    marked_for_deletion: u64,
    lookback_excluded: u64,
}

impl MetaFetcher {
    pub fn new(
        store: Store,
        config: MetaFetcherConfig,
        registry: &Registry,
        filters: Vec<Arc<dyn MetadataFilter>>,
        meta_cache: Option<Arc<MetaCache>>,
    ) -> Result<Self, NewMetaFetcherError> {
        if config.concurrency == 0 {
            return Err(NewMetaFetcherError::InvalidConcurrency);
        }

        let disk_cache = match &config.cache_dir {
            Some(dir) => Some(DiskMetaCache::open(dir)?),
            None => None,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                concurrency: config.concurrency,
                max_lookback: config.max_lookback,
                filters,
                metrics: FetcherMetrics::new(registry, &[]),
                disk_cache,
                meta_cache,
                cached: Mutex::new(Arc::new(HashMap::new())),
                inflight: Mutex::new(None),
            }),
        })
    }

    /// Returns all block metas as well as partial blocks (blocks without or
    /// with corrupted meta file) from the bucket. The returned maps are owned
    /// by the caller; the metadata values must not be modified.
    pub async fn fetch(&self) -> Result<FetchResult, FetchError> {
        self.fetch_inner(false).await
    }

    /// Like [`fetch`](Self::fetch), but excludes all blocks found in the
    /// global deletion-mark index (no deletion delay applied).
    pub async fn fetch_excluding_deletion_marked(&self) -> Result<FetchResult, FetchError> {
        self.fetch_inner(true).await
    }

    /// Snapshot of the last complete fetch.
    pub fn cached_metas(&self) -> BlockMetas {
        (**self.inner.cached.lock()).clone()
    }

    async fn fetch_inner(&self, exclude_marked: bool) -> Result<FetchResult, FetchError> {
        let started = Instant::now();
        self.inner.metrics.syncs.inc();
        self.inner.metrics.reset_tx();

        let result = self.fetch_and_filter(exclude_marked).await;

        self.inner
            .metrics
            .sync_duration
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(fetched) => {
                info!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    cached = self.count_cached(),
                    returned = fetched.metas.len(),
                    partial = fetched.partial.len(),
                    "successfully synchronized block metadata"
                );
            }
            Err(_) => self.inner.metrics.sync_failures.inc(),
        }
        result
    }

    async fn fetch_and_filter(&self, exclude_marked: bool) -> Result<FetchResult, FetchError> {
        let response = self
            .coalesced_scan(exclude_marked)
            .await
            .map_err(FetchError::Sync)?;

        // The same scan response may be shared with other callers, and the
        // caller owns the returned maps, so copy.
        let mut metas = response.metas.clone();
        let partial = response.partial.clone();

        let synced = &self.inner.metrics.synced;
        synced.set(FAILED_META, response.meta_errs.len() as i64);
        synced.set(NO_META, response.no_metas as i64);
        synced.set(CORRUPTED_META, response.corrupted as i64);
        synced.set(LOOKBACK_EXCLUDED_META, response.lookback_excluded as i64);
        if exclude_marked {
            synced.set(
                MARKED_FOR_DELETION_META,
                response.marked_for_deletion as i64,
            );
        }

        for filter in &self.inner.filters {
            // A filter updates the synced gauge according to its exclusion
            // reason.
            filter
                .filter(&mut metas, synced)
                .await
                .map_err(FetchError::Filter)?;
        }

        synced.set(LOADED_META, metas.len() as i64);
        self.inner.metrics.submit();

        if !response.meta_errs.is_empty() {
            return Err(FetchError::Incomplete {
                metas,
                partial,
                errors: response.meta_errs.clone(),
            });
        }
        Ok(FetchResult { metas, partial })
    }

    /// At most one scan runs per fetcher; callers arriving while one is in
    /// flight attach to it and observe the same response.
    async fn coalesced_scan(&self, exclude_marked: bool) -> ScanOutput {
        let shared = {
            let mut slot = self.inner.inflight.lock();
            match slot.as_ref().and_then(WeakShared::upgrade) {
                Some(active) => active,
                None => {
                    let this = self.clone();
                    let scan = async move { this.scan(exclude_marked).await }
                        .boxed()
                        .shared();
                    *slot = scan.downgrade();
                    scan
                }
            }
        };
        shared.await
    }

    async fn scan(self, exclude_marked: bool) -> ScanOutput {
        let inner = &*self.inner;
        debug!(
            concurrency = inner.concurrency,
            max_lookback = ?inner.max_lookback,
            "fetching block metadata"
        );

        // The first 6 bytes of a ULID are sortable as a function of time:
        // blocks with IDs below the floor pre-date the lookback window and
        // are skipped without loading.
        let min_allowed = inner
            .max_lookback
            .map(|lookback| block::lookback_floor(SystemTime::now(), lookback));

        // Get the list of blocks marked for deletion so that we'll exclude
        // them (if required).
        let marked = if exclude_marked {
            Some(
                block::list_deletion_marks(&inner.store)
                    .await
                    .map_err(|err| Arc::new(SyncError::ListDeletionMarks(err)))?,
            )
        } else {
            None
        };

        let listing = inner
            .store
            .top_level()
            .await
            .map_err(|err| Arc::new(SyncError::List(err)))?;

        let mut response = ScanResponse::default();
        let mut ids = Vec::new();
        for prefix in &listing.common_prefixes {
            let Some(id) = prefix.filename().and_then(block::is_block_dir) else {
                continue;
            };
            if let Some(marked) = &marked {
                if marked.contains(&id) {
                    response.marked_for_deletion += 1;
                    continue;
                }
            }
            if let Some(min_allowed) = min_allowed {
                if id < min_allowed {
                    response.lookback_excluded += 1;
                    continue;
                }
            }
            ids.push(id);
        }

        let cached = inner.cached.lock().clone();
        let mut meta_errs = Vec::new();
        let mut loads = futures::stream::iter(ids.into_iter().map(|id| {
            let this = self.clone();
            let cached = cached.clone();
            async move { (id, this.load_meta(&cached, id).await) }
        }))
        .buffer_unordered(inner.concurrency);

        while let Some((id, result)) = loads.next().await {
            match result {
                Ok(meta) => {
                    response.metas.insert(id, meta);
                }
                Err(err @ LoadMetaError::NotFound(_)) => {
                    response.no_metas += 1;
                    response.partial.insert(id, Arc::new(err));
                }
                Err(err @ LoadMetaError::Corrupted { .. }) => {
                    response.corrupted += 1;
                    response.partial.insert(id, Arc::new(err));
                }
                Err(err) => meta_errs.push(err),
            }
        }
        drop(loads);
        response.meta_errs = MultiError::new(meta_errs);

        // Only a complete view may replace the snapshot; a partial one would
        // poison later loads.
        if response.meta_errs.is_empty() {
            *inner.cached.lock() = Arc::new(response.metas.clone());

            if let Some(disk_cache) = &inner.disk_cache {
                disk_cache.prune(&response.metas);
            }
        }

        Ok(Arc::new(response))
    }

    /// Resolves one block ID to its metadata, consulting the last complete
    /// fetch, the shared LRU, and the local disk before the object store.
    ///
    /// meta.json is immutable once uploaded, so any cache tier that has the
    /// block at all is authoritative; this significantly reduces pressure on
    /// the object storage. A block deleted from the bucket after the listing
    /// can still be served from a cache here; that race also exists when
    /// reading the bucket directly, because the deletion could start right
    /// after the check.
    async fn load_meta(
        &self,
        cached: &BlockMetas,
        id: Ulid,
    ) -> Result<Arc<BlockMeta>, LoadMetaError> {
        let inner = &*self.inner;

        if let Some(meta) = cached.get(&id) {
            return Ok(meta.clone());
        }

        if let Some(meta_cache) = &inner.meta_cache {
            if let Some(meta) = meta_cache.get(id) {
                return Ok(meta);
            }
        }

        if let Some(disk_cache) = &inner.disk_cache {
            if let Some(meta) = disk_cache.read(id) {
                if let Some(meta_cache) = &inner.meta_cache {
                    meta_cache.put(&meta);
                }
                return Ok(meta);
            }
        }

        let path = block::meta_path(id);
        let raw = match inner.store.get_bytes(path.clone()).await {
            Ok(raw) => raw,
            // meta.json was deleted between the listing and here.
            Err(err) if err.is_not_found() => return Err(LoadMetaError::NotFound(err)),
            Err(err) => {
                return Err(LoadMetaError::Store {
                    path: path.to_string(),
                    source: err,
                })
            }
        };

        let meta: BlockMeta =
            serde_json::from_slice(&raw).map_err(|source| LoadMetaError::Corrupted {
                path: path.to_string(),
                source,
            })?;
        if meta.version != TSDB_VERSION_1 {
            return Err(LoadMetaError::UnexpectedVersion {
                path: path.to_string(),
                version: meta.version,
            });
        }
        let meta = Arc::new(meta);

        if let Some(disk_cache) = &inner.disk_cache {
            disk_cache.write(id, &raw);
        }
        if let Some(meta_cache) = &inner.meta_cache {
            meta_cache.put(&meta);
        }
        Ok(meta)
    }

    fn count_cached(&self) -> usize {
        self.inner.cached.lock().len()
    }
}

#[async_trait]
impl MetadataFetcher for MetaFetcher {
    async fn fetch(&self) -> Result<FetchResult, FetchError> {
        MetaFetcher::fetch(self).await
    }
}
