//! The block data model: `meta.json` and `deletion-mark.json` descriptors,
//! block directory naming, and the global deletion-mark index.

use std::{
    collections::HashSet,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::StreamExt;
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::store::{Store, StoreError};

pub const META_FILENAME: &str = "meta.json";
pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";

/// Directory holding the global copies of per-block deletion marks.
pub const MARKERS_DIR: &str = "markers";

/// The only supported `meta.json` format version.
pub const TSDB_VERSION_1: i32 = 1;

/// Descriptor of one immutable block, parsed from `<id>/meta.json`.
///
/// Fields this crate does not interpret are preserved verbatim in `extra`, so
/// a descriptor survives a parse/serialize round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub ulid: Ulid,
    pub version: i32,

    /// Time range of the samples in the block, in milliseconds since epoch.
    #[serde(rename = "minTime")]
    pub min_time: i64,
    #[serde(rename = "maxTime")]
    pub max_time: i64,

    pub compaction: Compaction,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compaction {
    pub level: i32,

    /// IDs of the level-1 blocks this block was compacted from.
    pub sources: Vec<Ulid>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<BlockDesc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDesc {
    pub ulid: Ulid,
    #[serde(rename = "minTime")]
    pub min_time: i64,
    #[serde(rename = "maxTime")]
    pub max_time: i64,
}

/// Sidecar recording the intent to delete a block, parsed from
/// `<id>/deletion-mark.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionMark {
    /// Unix seconds at which the block was marked.
    #[serde(rename = "deletionTime")]
    pub deletion_time: i64,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Returns the block ID iff `name` is a block directory name: its base
/// component parses as a ULID.
pub fn is_block_dir(name: &str) -> Option<Ulid> {
    Ulid::from_string(name.trim_end_matches('/')).ok()
}

pub fn meta_path(id: Ulid) -> Path {
    Path::from(format!("{}/{}", id, META_FILENAME))
}

pub fn deletion_mark_path(id: Ulid) -> Path {
    Path::from(format!("{}/{}", id, DELETION_MARK_FILENAME))
}

/// Location of a block's deletion mark inside the global markers directory.
pub fn deletion_mark_index_path(id: Ulid) -> Path {
    Path::from(format!("{}/{}-{}", MARKERS_DIR, id, DELETION_MARK_FILENAME))
}

/// The smallest block ID still inside the lookback window ending at `now`.
///
/// The upper 48 bits of a ULID are its creation time in milliseconds, so a
/// ULID built from the window start with a zero random tail sorts below every
/// ID created inside the window.
pub fn lookback_floor(now: SystemTime, lookback: Duration) -> Ulid {
    let now_ms = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let floor_ms = now_ms.saturating_sub(lookback.as_millis() as u64);
    Ulid::from_parts(floor_ms, 0)
}

#[derive(Debug, thiserror::Error)]
pub enum MarkerError {
    #[error("deletion-mark.json not found: {0}")]
    NotFound(#[source] StoreError),

    #[error("unmarshal deletion-mark.json {path}: {source}")]
    Corrupted {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("get deletion-mark.json {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: StoreError,
    },
}

/// Reads `<id>/deletion-mark.json`. Absence is reported through the
/// `NotFound` sentinel so callers can treat it as the normal case.
pub async fn read_deletion_mark(store: &Store, id: Ulid) -> Result<DeletionMark, MarkerError> {
    let path = deletion_mark_path(id);
    let raw = match store.get_bytes(path.clone()).await {
        Ok(raw) => raw,
        Err(err) if err.is_not_found() => return Err(MarkerError::NotFound(err)),
        Err(err) => {
            return Err(MarkerError::Store {
                path: path.to_string(),
                source: err,
            })
        }
    };
    serde_json::from_slice(&raw).map_err(|source| MarkerError::Corrupted {
        path: path.to_string(),
        source,
    })
}

/// Enumerates the global deletion-mark index: every `markers/` entry named
/// `<ulid>-deletion-mark.json`. Unrelated objects under the prefix are
/// ignored.
pub async fn list_deletion_marks(store: &Store) -> Result<HashSet<Ulid>, StoreError> {
    let mut objects = store.list(MARKERS_DIR);
    let mut ids = HashSet::new();
    while let Some(object) = objects.next().await {
        let object = object?;
        let Some(name) = object.location.filename() else {
            continue;
        };
        let Some(id) = name
            .strip_suffix(DELETION_MARK_FILENAME)
            .and_then(|n| n.strip_suffix('-'))
            .and_then(|n| Ulid::from_string(n).ok())
        else {
            continue;
        };
        ids.insert(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta_json(id: Ulid) -> String {
        format!(
            r#"{{
                "ulid": "{id}",
                "minTime": 1000,
                "maxTime": 2000,
                "version": 1,
                "compaction": {{
                    "level": 2,
                    "sources": ["{id}"],
                    "parents": [{{"ulid": "{id}", "minTime": 1000, "maxTime": 1500}}],
                    "hints": ["no-compact"]
                }},
                "stats": {{"numSamples": 42, "numSeries": 7}},
                "thanos": {{"labels": {{"cluster": "eu-west"}}}}
            }}"#
        )
    }

    #[test]
    fn block_dir_names() {
        let id = Ulid::new();
        assert_eq!(is_block_dir(&id.to_string()), Some(id));
        assert_eq!(is_block_dir(&format!("{id}/")), Some(id));
        assert_eq!(is_block_dir("markers"), None);
        assert_eq!(is_block_dir("wal/"), None);
        assert_eq!(is_block_dir(""), None);
    }

    #[test]
    fn meta_roundtrip_preserves_unknown_fields() {
        let id = Ulid::new();
        let raw = sample_meta_json(id);
        let meta: BlockMeta = serde_json::from_str(&raw).unwrap();

        assert_eq!(meta.ulid, id);
        assert_eq!(meta.version, TSDB_VERSION_1);
        assert_eq!(meta.compaction.level, 2);
        assert_eq!(meta.compaction.sources, vec![id]);
        assert_eq!(meta.compaction.parents.len(), 1);
        assert_eq!(
            meta.compaction.hints.as_deref(),
            Some(&["no-compact".to_string()][..])
        );
        assert!(meta.extra.contains_key("stats"));
        assert!(meta.extra.contains_key("thanos"));

        let reencoded: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&meta).unwrap()).unwrap();
        let original: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(reencoded, original);
    }

    #[test]
    fn meta_without_parents_or_hints() {
        let id = Ulid::new();
        let raw = format!(
            r#"{{"ulid":"{id}","minTime":0,"maxTime":1,"version":1,"compaction":{{"level":1,"sources":["{id}"]}}}}"#
        );
        let meta: BlockMeta = serde_json::from_str(&raw).unwrap();
        assert!(meta.compaction.parents.is_empty());
        assert!(meta.compaction.hints.is_none());

        // Absent fields stay absent after a round-trip.
        let reencoded: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&meta).unwrap()).unwrap();
        let original: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(reencoded, original);
    }

    #[test]
    fn broken_meta_fails_to_parse() {
        assert!(serde_json::from_str::<BlockMeta>(r#"{"version":1,broken"#).is_err());
    }

    #[test]
    fn deletion_mark_parsing() {
        let mark: DeletionMark =
            serde_json::from_str(r#"{"deletionTime": 123, "details": "compacted away"}"#).unwrap();
        assert_eq!(mark.deletion_time, 123);
        assert!(mark.extra.contains_key("details"));
    }

    #[test]
    fn lookback_floor_orders_ids_by_creation_time() {
        let now = SystemTime::now();
        let now_ms = now.duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
        let floor = lookback_floor(now, Duration::from_secs(3600));

        let recent = Ulid::from_parts(now_ms - 30 * 60 * 1000, 7);
        let stale = Ulid::from_parts(now_ms - 90 * 60 * 1000, 7);
        assert!(recent > floor);
        assert!(stale < floor);
    }

    #[tokio::test]
    async fn deletion_mark_sentinels() {
        let store = Store::in_memory();
        let id = Ulid::new();

        let err = read_deletion_mark(&store, id).await.unwrap_err();
        assert!(matches!(err, MarkerError::NotFound(_)));

        store
            .put_bytes(deletion_mark_path(id), vec![b'{'])
            .await
            .unwrap();
        let err = read_deletion_mark(&store, id).await.unwrap_err();
        assert!(matches!(err, MarkerError::Corrupted { .. }));

        store
            .put_bytes(
                deletion_mark_path(id),
                br#"{"deletionTime": 99}"#.to_vec(),
            )
            .await
            .unwrap();
        let mark = read_deletion_mark(&store, id).await.unwrap();
        assert_eq!(mark.deletion_time, 99);
    }

    #[tokio::test]
    async fn list_deletion_marks_ignores_unrelated_objects() {
        let store = Store::in_memory();
        let a = Ulid::new();
        let b = Ulid::new();

        for id in [a, b] {
            store
                .put_bytes(
                    deletion_mark_index_path(id),
                    br#"{"deletionTime": 1}"#.to_vec(),
                )
                .await
                .unwrap();
        }
        store
            .put_bytes(format!("{}/README", MARKERS_DIR), vec![b'x'])
            .await
            .unwrap();
        store
            .put_bytes(
                format!("{}/not-a-ulid-{}", MARKERS_DIR, DELETION_MARK_FILENAME),
                vec![b'x'],
            )
            .await
            .unwrap();

        let ids = list_deletion_marks(&store).await.unwrap();
        assert_eq!(ids, HashSet::from([a, b]));
    }
}
