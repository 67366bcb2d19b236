//! Reconciles an in-memory view of block metadata with the authoritative
//! state in a remote object store: concurrent bucket enumeration, multi-tier
//! meta caching, single-flight coalescing of concurrent fetches, and a
//! post-fetch filter pipeline.

pub mod cache;
mod disk_cache;
pub mod error;
pub mod fetcher;
pub mod filters;
pub mod metrics;

pub use cache::{CacheStats, MetaCache};
pub use error::{FetchError, LoadMetaError, MultiError, SyncError};
pub use fetcher::{
    BlockMetas, FetchResult, MetaFetcher, MetaFetcherConfig, MetadataFetcher, NewMetaFetcherError,
    PartialBlocks,
};
pub use filters::{IgnoreDeletionMarkFilter, MetadataFilter};
pub use metrics::{
    FetcherMetrics, TxGaugeVec, CORRUPTED_META, DUPLICATE_META, FAILED_META, LABEL_EXCLUDED_META,
    LOADED_META, LOOKBACK_EXCLUDED_META, MARKED_FOR_DELETION_META, MARKED_FOR_NO_COMPACTION_META,
    NO_META, TIME_EXCLUDED_META,
};
