//! Blob store seam
//!
//! Keys are `/`-separated relative paths. Writes replace the whole object.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{Result, TvError};

/// Durable object storage for replay files and claim markers
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read an object, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Create or replace an object
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Whether an object exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Names of the top-level prefixes
    async fn list_prefixes(&self) -> Result<Vec<String>>;
}

/// Filesystem-backed blob store rooted at a directory
pub struct FsBlobStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsBlobStore {
    /// Create a store rooted at `root`
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));

        if !clean {
            return Err(TvError::InvalidIdentifier(key.to_string()));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write beside the target and rename over it so readers never see a torn file
        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_file_name(format!(
            ".{}.tmp{}-{seq}",
            path.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("blob"),
            std::process::id()
        ));

        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }

        debug!("Wrote {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn list_prefixes(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut prefixes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    prefixes.push(name.to_string());
                }
            }
        }

        prefixes.sort();
        Ok(prefixes)
    }
}

/// In-memory blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBlobStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether the store holds no objects
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn list_prefixes(&self) -> Result<Vec<String>> {
        let objects = self.objects.read().await;
        let mut prefixes: Vec<String> = objects
            .keys()
            .filter_map(|key| key.split_once('/').map(|(prefix, _)| prefix.to_string()))
            .collect();
        prefixes.dedup();
        Ok(prefixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_put_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path().to_path_buf());

        store
            .put("abc/stream.0", Bytes::from_static(b"chunk"))
            .await
            .unwrap();

        assert!(store.exists("abc/stream.0").await.unwrap());
        assert_eq!(
            store.get("abc/stream.0").await.unwrap().unwrap(),
            Bytes::from_static(b"chunk")
        );
        assert!(store.get("abc/stream.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_overwrite_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path().to_path_buf());

        store.put("abc/timing.json", Bytes::from_static(b"[1]")).await.unwrap();
        store.put("abc/timing.json", Bytes::from_static(b"[2]")).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(temp_dir.path().join("abc"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
        assert_eq!(
            store.get("abc/timing.json").await.unwrap().unwrap(),
            Bytes::from_static(b"[2]")
        );
    }

    #[tokio::test]
    async fn test_fs_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path().to_path_buf());

        for key in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(matches!(
                store.get(key).await,
                Err(TvError::InvalidIdentifier(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_fs_list_prefixes() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path().to_path_buf());

        store.put("b/x", Bytes::new()).await.unwrap();
        store.put("a/y", Bytes::new()).await.unwrap();
        store.put("_claims/a.json", Bytes::new()).await.unwrap();

        assert_eq!(store.list_prefixes().await.unwrap(), vec!["_claims", "a", "b"]);
    }

    #[tokio::test]
    async fn test_fs_list_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path().join("missing"));
        assert!(store.list_prefixes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBlobStore::new();
        assert!(store.is_empty().await);

        store.put("b/1", Bytes::from_static(b"1")).await.unwrap();
        store.put("a/1", Bytes::from_static(b"2")).await.unwrap();
        store.put("a/2", Bytes::from_static(b"3")).await.unwrap();

        assert_eq!(store.len().await, 3);
        assert_eq!(store.list_prefixes().await.unwrap(), vec!["a", "b"]);
        assert!(store.exists("a/2").await.unwrap());
        assert!(!store.exists("a/3").await.unwrap());
    }
}
