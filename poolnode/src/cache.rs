use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::pool::{CacheSetFrame, PoolConnector};

/// Frame size used for remote cache uploads.
pub const DEFAULT_CACHE_CHUNK_BYTES: usize = 15 * 1024 * 1024;

/// Which tier a cache call targets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLocation {
    /// Files under the node's cache directory.
    #[default]
    Local,
    /// Versioned blob stored by the pool.
    Remote,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheOptions {
    pub version: u64,
    /// Expiry in milliseconds since the Unix epoch; zero never expires.
    pub expire_at: i64,
    pub location: CacheLocation,
    pub chunk_size: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            version: 0,
            expire_at: 0,
            location: CacheLocation::Local,
            chunk_size: DEFAULT_CACHE_CHUNK_BYTES,
        }
    }
}

impl CacheOptions {
    pub fn local(version: u64) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    pub fn remote(version: u64) -> Self {
        Self {
            version,
            location: CacheLocation::Remote,
            ..Default::default()
        }
    }

    pub fn with_expire_at(mut self, expire_at: i64) -> Self {
        self.expire_at = expire_at;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryMeta {
    version: u64,
    #[serde(default)]
    expire_at: i64,
}

impl EntryMeta {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expire_at > 0 && self.expire_at <= now_ms
    }
}

/// File-backed cache tier.
///
/// Each entry is a pair of files: `<key>.json` with the value and
/// `<key>.meta.json` with `{"version", "expireAt"}`.
#[derive(Clone, Debug)]
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let name = file_stem(key);
        (
            self.root.join(format!("{name}.json")),
            self.root.join(format!("{name}.meta.json")),
        )
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        version: u64,
        expire_at: i64,
    ) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let (value_path, meta_path) = self.entry_paths(key);
        let value = serde_json::to_vec(value)?;
        let meta = serde_json::to_vec(&EntryMeta { version, expire_at })?;
        tokio::try_join!(
            tokio::fs::write(&value_path, value),
            tokio::fs::write(&meta_path, meta),
        )?;
        Ok(())
    }

    /// Returns the value only if both files exist, the stored version is
    /// newer than `last_version` and the entry has not expired.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        last_version: u64,
    ) -> Result<Option<T>, CacheError> {
        let (value_path, meta_path) = self.entry_paths(key);
        if !tokio::fs::try_exists(&value_path).await? || !tokio::fs::try_exists(&meta_path).await? {
            return Ok(None);
        }

        let meta: EntryMeta = serde_json::from_slice(&tokio::fs::read(&meta_path).await?)?;
        if meta.version <= last_version || meta.is_expired(Utc::now().timestamp_millis()) {
            return Ok(None);
        }

        let value = tokio::fs::read(&value_path).await?;
        Ok(Some(serde_json::from_slice(&value)?))
    }
}

/// File name for `key`, kept inside the cache root.
///
/// `%`, path separators, NUL and `.` are written as `%XX`, so distinct keys
/// never share a file and no stem can end in `.meta`.
fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '%' | '/' | '\\' | '\0' | '.' => stem.push_str(&format!("%{:02X}", c as u32)),
            c => stem.push(c),
        }
    }
    stem
}

/// Pool-backed cache tier.
#[derive(Clone)]
pub struct RemoteCache {
    client: Arc<dyn PoolConnector>,
}

impl std::fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCache").finish_non_exhaustive()
    }
}

impl RemoteCache {
    pub fn new(client: Arc<dyn PoolConnector>) -> Self {
        Self { client }
    }

    /// Uploads the JSON encoding of `value` in `chunk_size` frames; returns
    /// the pool's success flag.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        version: u64,
        expire_at: i64,
        chunk_size: usize,
    ) -> Result<bool, CacheError> {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CACHE_CHUNK_BYTES
        } else {
            chunk_size
        };
        let data = Bytes::from(serde_json::to_vec(value)?);
        let mut call = self.client.cache_set().await?;

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            call.send(CacheSetFrame {
                key: key.to_string(),
                data: data.slice(offset..end),
                version,
                expire_at,
            })
            .await?;
            offset = end;
        }
        Ok(call.finish().await?)
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        last_version: u64,
    ) -> Result<Option<T>, CacheError> {
        let mut frames = self.client.cache_get(key, last_version).await?;
        let mut content = BytesMut::new();
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            if !frame.exists {
                return Ok(None);
            }
            content.extend_from_slice(&frame.data);
        }
        Ok(Some(serde_json::from_slice(&content)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_version_gate() {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::new(dir.path().join("cache"));

        cache.set("tools", &json!({"a": 1}), 2, 0).await.unwrap();

        let hit: Option<Value> = cache.get("tools", 1).await.unwrap();
        assert_eq!(hit, Some(json!({"a": 1})));
        let stale: Option<Value> = cache.get("tools", 2).await.unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_local_file_layout() {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::new(dir.path());
        cache.set("k", "v", 3, 1234).await.unwrap();

        let meta: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("k.meta.json")).unwrap()).unwrap();
        assert_eq!(meta, json!({"version": 3, "expireAt": 1234}));
        assert_eq!(std::fs::read_to_string(dir.path().join("k.json")).unwrap(), "\"v\"");
    }

    #[tokio::test]
    async fn test_local_expired_entry_is_miss() {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::new(dir.path());
        let past = Utc::now().timestamp_millis() - 1_000;
        let future = Utc::now().timestamp_millis() + 60_000;

        cache.set("old", &1, 1, past).await.unwrap();
        cache.set("fresh", &2, 1, future).await.unwrap();

        assert!(cache.get::<i32>("old", 0).await.unwrap().is_none());
        assert_eq!(cache.get::<i32>("fresh", 0).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_local_missing_entry() {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::new(dir.path());
        assert!(cache.get::<Value>("absent", 0).await.unwrap().is_none());
    }

    #[test]
    fn test_file_stem_escapes_separators() {
        assert_eq!(file_stem("k"), "k");
        assert_eq!(file_stem("a/b"), "a%2Fb");
        assert_eq!(file_stem("a_b"), "a_b");
        assert_eq!(file_stem(".x"), "%2Ex");
        assert_eq!(file_stem("50%"), "50%25");
    }

    #[tokio::test]
    async fn test_similar_keys_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::new(dir.path());
        let pairs = [("a/b", "a_b"), (".x", "x"), ("a%2Fb", "a/b"), ("a.meta", "a")];
        for (i, (first, second)) in pairs.iter().enumerate() {
            cache.set(first, &format!("first-{i}"), 1, 0).await.unwrap();
            cache.set(second, &format!("second-{i}"), 1, 0).await.unwrap();

            assert_eq!(
                cache.get::<String>(first, 0).await.unwrap(),
                Some(format!("first-{i}"))
            );
            assert_eq!(
                cache.get::<String>(second, 0).await.unwrap(),
                Some(format!("second-{i}"))
            );
        }
    }

    #[tokio::test]
    async fn test_keys_stay_inside_root() {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::new(dir.path().join("inner"));
        cache.set("../escape/x", &true, 1, 0).await.unwrap();

        assert!(!dir.path().join("escape").exists());
        assert_eq!(cache.get::<bool>("../escape/x", 0).await.unwrap(), Some(true));
    }
}
