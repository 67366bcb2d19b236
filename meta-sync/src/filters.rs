use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use common::{
    block::{self, DeletionMark, MarkerError},
    BoxError, Store,
};
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::warn;
use ulid::Ulid;

use crate::{
    fetcher::BlockMetas,
    metrics::{TxGaugeVec, MARKED_FOR_DELETION_META},
};

/// A post-fetch filter. Filters may remove entries from `metas` and must
/// account for every removal by incrementing `synced` under the matching
/// classification state.
#[async_trait]
pub trait MetadataFilter: Send + Sync {
    async fn filter(&self, metas: &mut BlockMetas, synced: &TxGaugeVec) -> Result<(), BoxError>;
}

/// Filters out blocks whose deletion mark is older than `delay`. The delay
/// makes sure a replacement block can be fetched before the old one
/// disappears from the view. Delay is not considered when computing the
/// tracked mark map.
pub struct IgnoreDeletionMarkFilter {
    store: Store,
    delay: Duration,
    concurrency: usize,

    marks: Mutex<Arc<HashMap<Ulid, Arc<DeletionMark>>>>,
}

impl IgnoreDeletionMarkFilter {
    pub fn new(store: Store, delay: Duration, concurrency: usize) -> Self {
        Self {
            store,
            delay,
            concurrency,
            marks: Mutex::new(Arc::new(HashMap::new())),
        }
    }

    /// Deletion marks seen by the most recent successful filter pass,
    /// including blocks whose mark is younger than the delay.
    pub fn deletion_mark_blocks(&self) -> HashMap<Ulid, Arc<DeletionMark>> {
        (**self.marks.lock()).clone()
    }
}

#[async_trait]
impl MetadataFilter for IgnoreDeletionMarkFilter {
    async fn filter(&self, metas: &mut BlockMetas, synced: &TxGaugeVec) -> Result<(), BoxError> {
        let mut marks = HashMap::new();

        // Copy the IDs up front; `metas` shrinks while the reads drain.
        let ids: Vec<Ulid> = metas.keys().copied().collect();
        let mut reads = futures::stream::iter(ids.into_iter().map(|id| async move {
            (id, block::read_deletion_mark(&self.store, id).await)
        }))
        .buffer_unordered(self.concurrency.max(1));

        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let mut last_err: Option<MarkerError> = None;

        while let Some((id, result)) = reads.next().await {
            let mark = match result {
                Ok(mark) => Arc::new(mark),
                Err(MarkerError::NotFound(_)) => continue,
                Err(err @ MarkerError::Corrupted { .. }) => {
                    warn!(
                        block = %id,
                        error = %err,
                        "found partial deletion-mark.json; if it happens often for the same \
                         block, consider deleting deletion-mark.json from the object storage"
                    );
                    continue;
                }
                // Remember the last error and continue to drain the stream.
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };

            marks.insert(id, mark.clone());
            if now_secs - mark.deletion_time > self.delay.as_secs() as i64 {
                synced.inc(MARKED_FOR_DELETION_META);
                metas.remove(&id);
            }
        }
        drop(reads);

        if let Some(err) = last_err {
            return Err(err.into());
        }

        // Replace wholesale so concurrent readers see the old map or the new
        // one, never a half-built one.
        *self.marks.lock() = Arc::new(marks);
        Ok(())
    }
}
