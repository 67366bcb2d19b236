use std::{collections::HashMap, fmt, sync::Arc};

use common::{block::BlockMeta, BoxError, StoreError};
use ulid::Ulid;

/// Outcome of loading a single block's `meta.json`.
///
/// `NotFound` and `Corrupted` are the expected classification errors: the
/// block is reported as partial and the fetch carries on. The remaining
/// variants render the fetched view incomplete.
#[derive(Debug, thiserror::Error)]
pub enum LoadMetaError {
    #[error("meta.json not found: {0}")]
    NotFound(#[source] StoreError),

    #[error("meta.json corrupted: {path}: {source}")]
    Corrupted {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected meta file version: {path}: {version}")]
    UnexpectedVersion { path: String, version: i32 },

    #[error("get meta file: {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: StoreError,
    },
}

/// Accumulated per-block errors of one fetch pass. Cheap to clone so the
/// coalesced scan result can fan out to every concurrent caller.
#[derive(Debug, Clone, Default)]
pub struct MultiError {
    errs: Arc<Vec<LoadMetaError>>,
}

impl MultiError {
    pub fn new(errs: Vec<LoadMetaError>) -> Self {
        Self {
            errs: Arc::new(errs),
        }
    }

    pub fn len(&self) -> usize {
        self.errs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadMetaError> {
        self.errs.iter()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.errs.len())?;
        for (i, err) in self.errs.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Fatal failure of the shared metadata scan.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("iter bucket: {0}")]
    List(#[source] StoreError),

    #[error("list block deletion marks: {0}")]
    ListDeletionMarks(#[source] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The scan itself failed; no maps are available.
    #[error("synchronize block metadata: {0}")]
    Sync(Arc<SyncError>),

    /// A post-fetch filter failed; no maps are available.
    #[error("filter metas: {0}")]
    Filter(BoxError),

    /// Some blocks failed to load for non-classification reasons. The maps
    /// carry everything that did load and remain valid.
    #[error("incomplete view: {errors}")]
    Incomplete {
        metas: HashMap<Ulid, Arc<BlockMeta>>,
        partial: HashMap<Ulid, Arc<LoadMetaError>>,
        errors: MultiError,
    },
}
