use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use common::block::{BlockMeta, META_FILENAME, TSDB_VERSION_1};
use fs_err as fs;
use tracing::warn;
use ulid::Ulid;

const CACHE_SUBDIR: &str = "meta-syncer";

/// Local directory of per-block `meta.json` copies, used to warm-start a
/// fetcher without hitting the object store. All operations after `open` are
/// best-effort: failures are logged and treated as a cache miss.
pub(crate) struct DiskMetaCache {
    dir: PathBuf,
}

impl DiskMetaCache {
    pub fn open(cache_dir: &Path) -> io::Result<Self> {
        let dir = cache_dir.join(CACHE_SUBDIR);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn block_dir(&self, id: Ulid) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Reads a cached meta.json. A present but unreadable entry is removed so
    /// the next attempt starts clean.
    pub fn read(&self, id: Ulid) -> Option<Arc<BlockMeta>> {
        let block_dir = self.block_dir(id);
        let raw = match fs::read(block_dir.join(META_FILENAME)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                self.remove_unreadable(&block_dir, &err.to_string());
                return None;
            }
        };

        match serde_json::from_slice::<BlockMeta>(&raw) {
            Ok(meta) if meta.version == TSDB_VERSION_1 => Some(Arc::new(meta)),
            Ok(meta) => {
                self.remove_unreadable(
                    &block_dir,
                    &format!("unexpected meta file version: {}", meta.version),
                );
                None
            }
            Err(err) => {
                self.remove_unreadable(&block_dir, &err.to_string());
                None
            }
        }
    }

    fn remove_unreadable(&self, block_dir: &Path, reason: &str) {
        warn!(
            dir = %block_dir.display(),
            error = reason,
            "best effort read of the local meta.json failed; removing cached block dir"
        );
        if let Err(err) = fs::remove_dir_all(block_dir) {
            warn!(
                dir = %block_dir.display(),
                error = %err,
                "best effort remove of cached dir failed; ignoring"
            );
        }
    }

    /// Persists the raw remote bytes, keeping the cached copy byte-identical
    /// to the object in the store.
    pub fn write(&self, id: Ulid, raw: &[u8]) {
        let block_dir = self.block_dir(id);
        if let Err(err) = fs::create_dir_all(&block_dir) {
            warn!(
                dir = %block_dir.display(),
                error = %err,
                "best effort mkdir of the meta.json block dir failed; ignoring"
            );
            return;
        }
        if let Err(err) = fs::write(block_dir.join(META_FILENAME), raw) {
            warn!(
                dir = %block_dir.display(),
                error = %err,
                "best effort save of the meta.json to local dir failed; ignoring"
            );
        }
    }

    /// Removes cached directories for blocks absent from the last complete
    /// fetch. Directories whose name is not a block ID are left alone.
    pub fn prune(&self, keep: &HashMap<Ulid, Arc<BlockMeta>>) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    error = %err,
                    "best effort remove of not needed cached dirs failed; ignoring"
                );
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(common::block::is_block_dir) else {
                continue;
            };
            if keep.contains_key(&id) {
                continue;
            }

            // No such block loaded, remove the local dir.
            let block_dir = self.block_dir(id);
            if let Err(err) = fs::remove_dir_all(&block_dir) {
                warn!(
                    dir = %block_dir.display(),
                    error = %err,
                    "best effort remove of not needed cached dir failed; ignoring"
                );
            }
        }
    }
}
