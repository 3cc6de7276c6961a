//! Cache bucket storage: named buckets of request-key to response snapshots.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::request::Response;
use crate::error::{Error, Result};

/// Trait for cache bucket backends.
///
/// `put` is an idempotent overwrite: concurrent writers to the same key
/// race with last-write-wins semantics.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Creates the bucket if it does not exist.
    async fn open(&self, bucket: &str) -> Result<()>;

    /// Stores `response` under `key`, creating the bucket if needed.
    async fn put(&self, bucket: &str, key: &str, response: &Response) -> Result<()>;

    /// Looks up `key` in one bucket.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Response>>;

    /// Names of every existing bucket, sorted.
    async fn buckets(&self) -> Result<Vec<String>>;

    /// Number of entries in a bucket (zero when absent).
    async fn len(&self, bucket: &str) -> Result<usize>;

    /// Deletes a bucket and all of its entries. Returns whether it existed.
    async fn delete(&self, bucket: &str) -> Result<bool>;
}

/// Looks up `key` in every bucket whose name starts with `prefix`, searching
/// from the highest bucket name down.
///
/// # Errors
///
/// Returns an error if the backend cannot be read.
pub async fn match_any(
    storage: &dyn CacheStorage,
    prefix: &str,
    key: &str,
) -> Result<Option<Response>> {
    for bucket in storage.buckets().await?.iter().rev() {
        if !bucket.starts_with(prefix) {
            continue;
        }
        if let Some(response) = storage.get(bucket, key).await? {
            return Ok(Some(response));
        }
    }
    Ok(None)
}

fn validate_bucket(bucket: &str) -> Result<()> {
    let valid = !bucket.is_empty()
        && bucket != "."
        && bucket != ".."
        && bucket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidBucket(bucket.to_string()))
    }
}

/// In-memory bucket storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    buckets: RwLock<BTreeMap<String, BTreeMap<String, Response>>>,
}

impl MemoryCacheStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, bucket: &str) -> Result<()> {
        validate_bucket(bucket)?;
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn put(&self, bucket: &str, key: &str, response: &Response) -> Result<()> {
        validate_bucket(bucket)?;
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), response.clone());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Response>> {
        Ok(self
            .buckets
            .read()
            .await
            .get(bucket)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn buckets(&self) -> Result<Vec<String>> {
        Ok(self.buckets.read().await.keys().cloned().collect())
    }

    async fn len(&self, bucket: &str) -> Result<usize> {
        Ok(self
            .buckets
            .read()
            .await
            .get(bucket)
            .map_or(0, BTreeMap::len))
    }

    async fn delete(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.write().await.remove(bucket).is_some())
    }
}

/// Metadata written next to each cached body.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    response: Response,
}

/// On-disk bucket storage using `tokio::fs`.
///
/// Layout: `<root>/<bucket>/<sha256(key)>.json` holds the metadata and
/// `<sha256(key)>.body` the payload. Both are written to a temporary file
/// and renamed into place.
#[derive(Debug, Clone)]
pub struct DiskCacheStorage {
    root: PathBuf,
}

impl DiskCacheStorage {
    /// Creates a storage rooted at `root`. Nothing is created until first use.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory holding the buckets.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        validate_bucket(bucket)?;
        Ok(self.root.join(bucket))
    }

    fn entry_stem(key: &str) -> String {
        format!("{:x}", Sha256::digest(key.as_bytes()))
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp_path, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, bucket: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.bucket_dir(bucket)?).await?;
        Ok(())
    }

    async fn put(&self, bucket: &str, key: &str, response: &Response) -> Result<()> {
        let dir = self.bucket_dir(bucket)?;
        tokio::fs::create_dir_all(&dir).await?;

        let stem = Self::entry_stem(key);
        let meta = serde_json::to_vec(&EntryMeta {
            key: key.to_string(),
            response: response.clone(),
        })?;
        // Body first so a visible metadata file always has its payload.
        write_atomic(&dir.join(format!("{stem}.body")), &response.body).await?;
        write_atomic(&dir.join(format!("{stem}.json")), &meta).await?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Response>> {
        let dir = self.bucket_dir(bucket)?;
        let stem = Self::entry_stem(key);

        let meta = match tokio::fs::read(dir.join(format!("{stem}.json"))).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: EntryMeta = serde_json::from_slice(&meta)?;
        if meta.key != key {
            return Ok(None);
        }
        let body = match tokio::fs::read(dir.join(format!("{stem}.body"))).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(Response {
            body,
            ..meta.response
        }))
    }

    async fn buckets(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn len(&self, bucket: &str) -> Result<usize> {
        let mut read_dir = match tokio::fs::read_dir(self.bucket_dir(bucket)?).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete(&self, bucket: &str) -> Result<bool> {
        match tokio::fs::remove_dir_all(self.bucket_dir(bucket)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use url::Url;

    fn response(body: &'static str) -> Response {
        Response::ok(&Url::parse("http://app.test/").unwrap(), body)
            .with_header("content-type", "text/html")
    }

    async fn exercise(storage: &dyn CacheStorage) {
        assert!(storage.buckets().await.unwrap().is_empty());

        storage.open("detailer-v1.0.0").await.unwrap();
        assert_eq!(storage.buckets().await.unwrap(), vec!["detailer-v1.0.0"]);
        assert_eq!(storage.len("detailer-v1.0.0").await.unwrap(), 0);

        storage
            .put("detailer-v1.0.0", "http://app.test/", &response("one"))
            .await
            .unwrap();
        storage
            .put("detailer-v1.0.0", "http://app.test/", &response("two"))
            .await
            .unwrap();
        let cached = storage
            .get("detailer-v1.0.0", "http://app.test/")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.body, Bytes::from_static(b"two"));
        assert_eq!(cached.header("content-type"), Some("text/html"));
        assert_eq!(storage.len("detailer-v1.0.0").await.unwrap(), 1);

        assert!(
            storage
                .get("detailer-v1.0.0", "http://app.test/missing")
                .await
                .unwrap()
                .is_none()
        );
        assert!(storage.get("absent", "http://app.test/").await.unwrap().is_none());

        assert!(storage.delete("detailer-v1.0.0").await.unwrap());
        assert!(!storage.delete("detailer-v1.0.0").await.unwrap());
        assert!(storage.buckets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_storage_contract() {
        exercise(&MemoryCacheStorage::new()).await;
    }

    #[tokio::test]
    async fn disk_storage_contract() {
        let dir = TempDir::new().unwrap();
        exercise(&DiskCacheStorage::new(dir.path().join("buckets"))).await;
    }

    #[tokio::test]
    async fn disk_storage_survives_reopen() {
        let dir = TempDir::new().unwrap();
        DiskCacheStorage::new(dir.path())
            .put("detailer-v2.0.0", "http://app.test/", &response("shell"))
            .await
            .unwrap();

        let reopened = DiskCacheStorage::new(dir.path());
        let cached = reopened
            .get("detailer-v2.0.0", "http://app.test/")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.body, Bytes::from_static(b"shell"));
        assert_eq!(cached.status, 200);
    }

    #[tokio::test]
    async fn bucket_names_cannot_escape_root() {
        let storage = MemoryCacheStorage::new();
        for name in ["", "..", "../etc", "a/b", "a\\b"] {
            assert!(matches!(
                storage.open(name).await,
                Err(Error::InvalidBucket(_))
            ));
        }
        let dir = TempDir::new().unwrap();
        let disk = DiskCacheStorage::new(dir.path());
        assert!(disk.put("../x", "k", &response("x")).await.is_err());
    }

    #[tokio::test]
    async fn match_any_only_searches_own_buckets() {
        let storage = MemoryCacheStorage::new();
        storage
            .put("other-app", "http://app.test/version.json", &response("foreign"))
            .await
            .unwrap();
        assert!(
            match_any(&storage, "detailer-", "http://app.test/version.json")
                .await
                .unwrap()
                .is_none()
        );

        storage
            .put("detailer-v1.0.0", "http://app.test/version.json", &response("old"))
            .await
            .unwrap();
        let found = match_any(&storage, "detailer-", "http://app.test/version.json")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.body, Bytes::from_static(b"old"));
    }

    #[tokio::test]
    async fn concurrent_puts_last_write_wins() {
        let storage = std::sync::Arc::new(MemoryCacheStorage::new());
        let writes = (0..16).map(|_| {
            let storage = std::sync::Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .put("detailer-v1.0.0", "http://app.test/app.js", &response("js"))
                    .await
            })
        });
        for handle in futures::future::join_all(writes).await {
            handle.unwrap().unwrap();
        }
        assert_eq!(storage.len("detailer-v1.0.0").await.unwrap(), 1);
    }
}
