use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use fs_err as fs;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use object_store::{
    memory::InMemory, path::Path, prefix::PrefixStore, ListResult, ObjectMeta, ObjectStore,
    PutPayload,
};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("resolve store location '{location}': {source}")]
    Location {
        location: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ObjectStore(object_store::Error::NotFound { .. })
        )
    }
}

/// A wrapper around an `ObjectStore`. It resolves a location string (URL or
/// filesystem directory) into the right backend, scopes all accesses under the
/// location's path prefix, and carries the helper surface the block
/// synchronizer needs.
#[derive(Debug, Clone)]
pub struct Store {
    store: Arc<dyn ObjectStore>,
}

impl Store {
    /// Creates a store for an object store URL or filesystem directory.
    ///
    /// Examples of valid formats for `location`:
    /// - Filesystem path: `relative/path/to/data/`
    /// - GCS: `gs://bucket-name`
    /// - S3: `s3://bucket-name`
    /// - Prefixed: `s3://bucket-name/my_prefix/`
    ///
    /// If `location` is a relative filesystem path, then `base` will be used
    /// as the prefix. Cloud providers are configured through their usual
    /// environment variables (`AWS_*`, `GOOGLE_*`, `AZURE_*`).
    pub fn new(location: &str, base: Option<&std::path::Path>) -> Result<Self, StoreError> {
        let url = infer_url(location, base)?;
        let (inner, prefix) = object_store::parse_url(&url)?;
        let inner: Arc<dyn ObjectStore> = Arc::from(inner);
        let store: Arc<dyn ObjectStore> = if prefix.as_ref().is_empty() {
            inner
        } else {
            Arc::new(PrefixStore::new(inner, prefix))
        };
        Ok(Self { store })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
        }
    }

    /// Wraps an already-built backend. Callers use this to layer their own
    /// instrumentation or fault injection over the store.
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub async fn get_bytes(&self, location: impl Into<Path>) -> Result<Bytes, StoreError> {
        Ok(self.store.get(&location.into()).await?.bytes().await?)
    }

    pub async fn put_bytes(
        &self,
        location: impl Into<Path>,
        bytes: impl Into<Bytes>,
    ) -> Result<(), StoreError> {
        self.store
            .put(&location.into(), PutPayload::from(bytes.into()))
            .await?;
        Ok(())
    }

    /// One level of the store's hierarchy: top-level objects plus the
    /// "directories" underneath the store root.
    pub async fn top_level(&self) -> Result<ListResult, StoreError> {
        Ok(self.store.list_with_delimiter(None).await?)
    }

    pub fn list(&self, prefix: impl Into<Path>) -> BoxStream<'_, Result<ObjectMeta, StoreError>> {
        self.store
            .list(Some(&prefix.into()))
            .map_err(StoreError::from)
            .boxed()
    }
}

impl std::fmt::Display for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "store {}", self.store)
    }
}

fn infer_url(location: &str, base: Option<&std::path::Path>) -> Result<Url, StoreError> {
    let mut location = location.to_string();
    if !location.ends_with('/') {
        location.push('/');
    }
    match Url::parse(&location) {
        Ok(url) => Ok(url),

        // If the location is not a URL, we can still try to parse it as a
        // relative filesystem path.
        Err(_) => {
            let mut path = PathBuf::from(&location);
            if !path.is_absolute() {
                if let Some(base) = base {
                    path = base.join(path);
                }
            }

            // Error if the directory does not exist.
            let path = fs::canonicalize(path).map_err(|source| StoreError::Location {
                location: location.clone(),
                source,
            })?;

            Ok(Url::from_directory_path(path).unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = Store::in_memory();
        store
            .put_bytes("dir/file.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let bytes = store.get_bytes("dir/file.json").await.unwrap();
        assert_eq!(&bytes[..], b"{}");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = Store::in_memory();
        let err = store.get_bytes("nope.json").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn top_level_splits_objects_and_prefixes() {
        let store = Store::in_memory();
        store.put_bytes("index.json", vec![b'x']).await.unwrap();
        store.put_bytes("a/meta.json", vec![b'y']).await.unwrap();
        store.put_bytes("a/chunks/000001", vec![b'z']).await.unwrap();

        let listing = store.top_level().await.unwrap();
        let objects: Vec<_> = listing
            .objects
            .iter()
            .map(|o| o.location.as_ref().to_string())
            .collect();
        let prefixes: Vec<_> = listing
            .common_prefixes
            .iter()
            .map(|p| p.as_ref().to_string())
            .collect();
        assert_eq!(objects, vec!["index.json"]);
        assert_eq!(prefixes, vec!["a"]);
    }
}
