//! In-memory TTL-backed index mapping `(project, file)` to the list of
//! revisions' [`FileMetadata`] known for it.

use std::{sync::Arc, time::Duration};

use moka::sync::Cache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::MetaCacheConfig;

/// A single known revision of a single file within a project.
///
/// `etag` is the sole key into the local and remote blob caches. Empty string
/// is the "unset" sentinel for every field, matching the convention of an
/// absent upstream header.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub commit_hash: String,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub size: String,
}

impl FileMetadata {
    /// A record is eligible for caching only when both `etag` and `location`
    /// are non-empty.
    pub fn is_cacheable(&self) -> bool {
        !self.etag.is_empty() && !self.location.is_empty()
    }

    /// A record is a hit for `revision` if its tag matches exactly, or its
    /// commit hash starts with `revision` (a short prefix).
    pub fn matches_revision(&self, revision: &str) -> bool {
        self.tag == revision || self.commit_hash.starts_with(revision)
    }
}

/// Capability trait for the metadata index, narrow enough to substitute a
/// fake in tests.
pub trait MetaDataCache: Send + Sync {
    fn append_metadata(&self, project: &str, file: &str, meta: FileMetadata);
    fn search_metadata(&self, project: &str, file: &str, revision: &str) -> Option<FileMetadata>;
}

fn meta_key(project: &str, file: &str) -> String {
    format!("{project}_{file}")
}

/// Sharded TTL cache of serialized `Vec<FileMetadata>`, guarded by a single
/// read-write lock so that a read-modify-write append is atomic with respect
/// to concurrent appends and searches on the same key.
pub struct TtlMetaDataCache {
    cache: RwLock<Cache<String, Vec<u8>>>,
}

impl TtlMetaDataCache {
    pub fn new(cfg: &MetaCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(cfg.max_entries_in_window)
            .time_to_live(Duration::from_secs(cfg.life_window_secs))
            .build();
        Self {
            cache: RwLock::new(cache),
        }
    }

    fn load(&self, key: &str) -> Vec<FileMetadata> {
        let bytes = self.cache.read().get(key);
        match bytes {
            None => Vec::new(),
            Some(bytes) => match bincode::deserialize::<Vec<FileMetadata>>(&bytes) {
                Ok(metas) => metas,
                Err(err) => {
                    warn!(%key, error = %err, "failed to deserialize metadata cache entry, treating as miss");
                    Vec::new()
                }
            },
        }
    }
}

impl MetaDataCache for TtlMetaDataCache {
    fn append_metadata(&self, project: &str, file: &str, meta: FileMetadata) {
        let key = meta_key(project, file);
        let guard = self.cache.write();
        let mut metas = match guard.get(&key) {
            None => Vec::new(),
            Some(bytes) => bincode::deserialize::<Vec<FileMetadata>>(&bytes).unwrap_or_default(),
        };

        let mut found = false;
        for existing in metas.iter_mut() {
            if existing.tag == meta.tag || existing.commit_hash == meta.commit_hash {
                *existing = meta.clone();
                found = true;
                break;
            }
        }
        if !found {
            metas.push(meta);
        }

        match bincode::serialize(&metas) {
            Ok(bytes) => guard.insert(key, bytes),
            Err(err) => warn!(%key, error = %err, "failed to serialize metadata cache entry"),
        }
    }

    fn search_metadata(&self, project: &str, file: &str, revision: &str) -> Option<FileMetadata> {
        let key = meta_key(project, file);
        let metas = self.load(&key);
        metas.into_iter().find(|m| m.matches_revision(revision))
    }
}

pub type SharedMetaDataCache = Arc<dyn MetaDataCache>;

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TtlMetaDataCache {
        TtlMetaDataCache::new(&MetaCacheConfig::default())
    }

    fn meta(tag: &str, commit_hash: &str, etag: &str) -> FileMetadata {
        FileMetadata {
            tag: tag.to_string(),
            commit_hash: commit_hash.to_string(),
            etag: etag.to_string(),
            location: "https://example.com/blob".to_string(),
            size: "42".to_string(),
        }
    }

    #[test]
    fn search_miss_on_empty_index() {
        let cache = cache();
        assert!(cache.search_metadata("org/model", "file.json", "main").is_none());
    }

    #[test]
    fn append_then_search_by_tag() {
        let cache = cache();
        cache.append_metadata("org/model", "file.json", meta("main", "deadbeef", "abc123"));
        let found = cache.search_metadata("org/model", "file.json", "main").unwrap();
        assert_eq!(found.etag, "abc123");
    }

    #[test]
    fn short_commit_prefix_lookup() {
        let cache = cache();
        cache.append_metadata("org/model", "file.json", meta("main", "deadbeefcafe", "abc123"));
        assert!(cache.search_metadata("org/model", "file.json", "dead").is_some());
        assert!(cache.search_metadata("org/model", "file.json", "beef").is_none());
    }

    #[test]
    fn append_upserts_by_tag_in_place() {
        let cache = cache();
        cache.append_metadata("org/model", "file.json", meta("main", "aaa", "etag1"));
        cache.append_metadata("org/model", "file.json", meta("main", "bbb", "etag2"));
        // still exactly one record for tag "main", holding the latest value.
        let found = cache.search_metadata("org/model", "file.json", "main").unwrap();
        assert_eq!(found.etag, "etag2");
        assert!(cache.search_metadata("org/model", "file.json", "aaa").is_none());
    }

    #[test]
    fn append_upserts_by_commit_hash_in_place() {
        let cache = cache();
        cache.append_metadata("org/model", "file.json", meta("main", "deadbeef", "etag1"));
        cache.append_metadata("org/model", "file.json", meta("v2", "deadbeef", "etag2"));
        let found = cache.search_metadata("org/model", "file.json", "v2").unwrap();
        assert_eq!(found.etag, "etag2");
        // the "main" tag was replaced in place, so it no longer resolves.
        assert!(cache.search_metadata("org/model", "file.json", "main").is_none());
    }

    #[test]
    fn is_cacheable_requires_etag_and_location() {
        let mut m = meta("main", "deadbeef", "");
        assert!(!m.is_cacheable());
        m.etag = "abc123".to_string();
        assert!(m.is_cacheable());
        m.location.clear();
        assert!(!m.is_cacheable());
    }
}
