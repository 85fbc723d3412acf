//! Replay store: one directory per replay on top of a [`BlobStore`]

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::blob::BlobStore;
use super::id::ReplayId;
use super::package::ReplayPackage;
use super::record::ReplayRecord;
use super::timing::ChunkHeaders;
use super::{chunk_file_name, parse_chunk_index, METADATA_FILE, TIMING_FILE};
use crate::{Result, TvError};

/// A stored chunk with its synthesized headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    /// Raw chunk bytes
    pub data: Bytes,
    /// Timing headers, `None` when no timing entry exists for this index
    pub headers: Option<ChunkHeaders>,
}

/// Persisted layout of captured replays
///
/// `metadata.json` is written last and its presence alone marks a replay as
/// complete; chunk files without it are leftovers of an unfinished capture.
#[derive(Clone)]
pub struct ReplayStore {
    blobs: Arc<dyn BlobStore>,
}

impl ReplayStore {
    /// Create a store over a blob backend
    #[must_use]
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Underlying blob backend
    #[must_use]
    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Whether a complete record exists
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn has(&self, id: &ReplayId) -> Result<bool> {
        self.blobs.exists(&file_key(id, METADATA_FILE)).await
    }

    /// Read the record document
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if absent, or a backend/JSON error
    pub async fn read_record(&self, id: &ReplayId) -> Result<ReplayRecord> {
        let raw = self
            .blobs
            .get(&file_key(id, METADATA_FILE))
            .await?
            .ok_or_else(|| TvError::NotFound(format!("replay {id}")))?;

        Ok(serde_json::from_slice(&raw)?)
    }

    /// Write the record document, marking the replay complete
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the backend fails
    pub async fn write_record(&self, id: &ReplayId, record: &ReplayRecord) -> Result<()> {
        let raw = serde_json::to_vec(record)?;
        self.blobs
            .put(&file_key(id, METADATA_FILE), Bytes::from(raw))
            .await?;
        info!("Stored record {}", id);
        Ok(())
    }

    /// Read a chunk and its timing entry
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the chunk file is absent
    pub async fn read_chunk(&self, id: &ReplayId, index: u64) -> Result<StoredChunk> {
        let data = self
            .blobs
            .get(&file_key(id, &chunk_file_name(index)))
            .await?
            .ok_or_else(|| TvError::NotFound(format!("replay {id} chunk {index}")))?;

        let headers = self.timing_entry(id, index).await?;
        Ok(StoredChunk { data, headers })
    }

    /// Timing entry of chunk `index`, `None` when absent or empty
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails or the timing document is malformed
    pub async fn timing_entry(&self, id: &ReplayId, index: u64) -> Result<Option<ChunkHeaders>> {
        let timing = self.read_timing(id).await?;
        Ok(usize::try_from(index)
            .ok()
            .and_then(|slot| timing.get(slot))
            .filter(|headers| !headers.is_empty())
            .cloned())
    }

    /// Write a chunk and record its timing entry at the same index
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn write_chunk(
        &self,
        id: &ReplayId,
        index: u64,
        data: Bytes,
        headers: ChunkHeaders,
    ) -> Result<()> {
        self.blobs
            .put(&file_key(id, &chunk_file_name(index)), data)
            .await?;

        let slot = usize::try_from(index)
            .map_err(|_| TvError::Other(format!("chunk index {index} out of range")))?;
        let mut timing = self.read_timing(id).await?;
        if timing.len() <= slot {
            timing.resize(slot + 1, ChunkHeaders::default());
        }
        timing[slot] = headers;
        self.write_timing(id, &timing).await?;

        debug!("Stored {} chunk {}", id, index);
        Ok(())
    }

    /// Read the timing document, empty when absent
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails or the document is malformed
    pub async fn read_timing(&self, id: &ReplayId) -> Result<Vec<ChunkHeaders>> {
        match self.blobs.get(&file_key(id, TIMING_FILE)).await? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the timing document
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the backend fails
    pub async fn write_timing(&self, id: &ReplayId, timing: &[ChunkHeaders]) -> Result<()> {
        let raw = serde_json::to_vec(timing)?;
        self.blobs
            .put(&file_key(id, TIMING_FILE), Bytes::from(raw))
            .await
    }

    /// Read any replay file by name
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for unsafe names, or a backend error
    pub async fn read_file(&self, id: &ReplayId, name: &str) -> Result<Option<Bytes>> {
        validate_file_name(name)?;
        self.blobs.get(&file_key(id, name)).await
    }

    /// Write any replay file by name
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for unsafe names, or a backend error
    pub async fn write_file(&self, id: &ReplayId, name: &str, data: Bytes) -> Result<()> {
        validate_file_name(name)?;
        self.blobs.put(&file_key(id, name), data).await
    }

    /// Ids of every complete record
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn list_replay_ids(&self) -> Result<BTreeSet<ReplayId>> {
        let mut ids = BTreeSet::new();

        for prefix in self.blobs.list_prefixes().await? {
            let Ok(id) = ReplayId::parse(&prefix) else {
                continue;
            };
            if self.has(&id).await? {
                ids.insert(id);
            }
        }

        Ok(ids)
    }

    /// Unpack a replay package into the store
    ///
    /// Files go first, then the timing document, then the record. Nothing is
    /// written when a chunk file's index is out of range for the package.
    ///
    /// # Errors
    ///
    /// Returns error if the package id is invalid, a file cannot be decoded,
    /// or the backend fails
    pub async fn import_package(&self, package: &ReplayPackage) -> Result<ReplayId> {
        let id = ReplayId::parse(&package.data.find.id)?;
        let files = package.decode_files()?;

        // A chunk index can never reach the number of files in the package
        let mut timing: Vec<ChunkHeaders> = Vec::new();
        for file in &files {
            if let Some(index) = parse_chunk_index(&file.name) {
                let slot = usize::try_from(index)
                    .ok()
                    .filter(|slot| *slot < files.len())
                    .ok_or_else(|| {
                        TvError::InconsistentCapture(format!(
                            "package for {id} names chunk {index} but holds {} files",
                            files.len()
                        ))
                    })?;
                if timing.len() <= slot {
                    timing.resize(slot + 1, ChunkHeaders::default());
                }
                if let Some(headers) = &file.headers {
                    timing[slot] = headers.clone();
                }
            }
        }

        for file in files {
            self.write_file(&id, &file.name, file.data).await?;
        }

        if timing.iter().any(|headers| !headers.is_empty()) {
            self.write_timing(&id, &timing).await?;
        } else if !timing.is_empty() {
            warn!("Package {} carries no chunk headers", id);
        }

        self.write_record(&id, &package.data).await?;
        info!("Imported package for {}", id);
        Ok(id)
    }
}

fn file_key(id: &ReplayId, name: &str) -> String {
    format!("{id}/{name}")
}

/// Accept plain file names only: no separators, no leading dot
///
/// # Errors
///
/// Returns `InvalidIdentifier` for any other name
pub fn validate_file_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(TvError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob::{FsBlobStore, MemoryBlobStore};
    use crate::storage::record::fixtures;
    use tempfile::TempDir;

    fn memory_store() -> ReplayStore {
        ReplayStore::new(Arc::new(MemoryBlobStore::new()))
    }

    fn id(raw: &str) -> ReplayId {
        ReplayId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_record_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = ReplayStore::new(Arc::new(FsBlobStore::new(temp_dir.path().to_path_buf())));
        let replay = id("abc123");
        let record = fixtures::record("abc123", 10, false);

        assert!(!store.has(&replay).await.unwrap());
        assert!(matches!(
            store.read_record(&replay).await,
            Err(TvError::NotFound(_))
        ));

        store.write_record(&replay, &record).await.unwrap();

        assert!(store.has(&replay).await.unwrap());
        assert_eq!(store.read_record(&replay).await.unwrap(), record);
        assert!(temp_dir.path().join("abc123/metadata.json").exists());
    }

    #[tokio::test]
    async fn test_chunk_headers_align_with_index() {
        let store = memory_store();
        let replay = id("abc");
        let headers = ChunkHeaders {
            numchunks: Some("3".to_string()),
            state: Some("Live".to_string()),
            ..Default::default()
        };

        store
            .write_chunk(&replay, 2, Bytes::from_static(b"two"), headers.clone())
            .await
            .unwrap();
        store
            .write_chunk(&replay, 0, Bytes::from_static(b"zero"), ChunkHeaders::default())
            .await
            .unwrap();

        let timing = store.read_timing(&replay).await.unwrap();
        assert_eq!(timing.len(), 3);
        assert_eq!(timing[2], headers);

        let chunk = store.read_chunk(&replay, 2).await.unwrap();
        assert_eq!(chunk.data, Bytes::from_static(b"two"));
        assert_eq!(chunk.headers, Some(headers));

        let chunk = store.read_chunk(&replay, 0).await.unwrap();
        assert!(chunk.headers.is_none());

        assert!(matches!(
            store.read_chunk(&replay, 1).await,
            Err(TvError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_chunk_without_timing_document() {
        let store = memory_store();
        let replay = id("abc");
        store
            .write_file(&replay, "stream.0", Bytes::from_static(b"raw"))
            .await
            .unwrap();

        let chunk = store.read_chunk(&replay, 0).await.unwrap();
        assert_eq!(chunk.data, Bytes::from_static(b"raw"));
        assert!(chunk.headers.is_none());
    }

    #[tokio::test]
    async fn test_list_requires_metadata() {
        let store = memory_store();
        store
            .write_record(&id("done"), &fixtures::record("done", 1, false))
            .await
            .unwrap();
        store
            .write_chunk(&id("partial"), 0, Bytes::new(), ChunkHeaders::default())
            .await
            .unwrap();
        store
            .blobs()
            .put("_claims/done.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let ids = store.list_replay_ids().await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![id("done")]);
    }

    #[tokio::test]
    async fn test_file_name_validation() {
        let store = memory_store();
        let replay = id("abc");

        for name in ["../metadata.json", "a/b", ".hidden", "", ".."] {
            assert!(matches!(
                store.read_file(&replay, name).await,
                Err(TvError::InvalidIdentifier(_))
            ));
        }
        assert!(store.read_file(&replay, "replay.header").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_import_package() {
        let source = memory_store();
        let replay = id("abc123");
        let record = fixtures::record("abc123", 10, false);
        let headers = ChunkHeaders {
            numchunks: Some("1".to_string()),
            time: Some("900".to_string()),
            state: Some("Recorded".to_string()),
            ..Default::default()
        };
        let package = ReplayPackage::build(
            record.clone(),
            Some(&Bytes::from_static(b"HDR")),
            &[(Bytes::from_static(b"c0"), headers.clone())],
        );

        let imported = source.import_package(&package).await.unwrap();
        assert_eq!(imported, replay);
        assert_eq!(source.read_record(&replay).await.unwrap(), record);
        assert_eq!(
            source.read_file(&replay, "replay.header").await.unwrap(),
            Some(Bytes::from_static(b"HDR"))
        );

        let chunk = source.read_chunk(&replay, 0).await.unwrap();
        assert_eq!(chunk.data, Bytes::from_static(b"c0"));
        assert_eq!(chunk.headers, Some(headers));
    }

    #[tokio::test]
    async fn test_import_rejects_out_of_range_chunk_index() {
        let record = fixtures::record("abc123", 10, false);
        let valid = ReplayPackage::build(
            record,
            None,
            &[(Bytes::from_static(b"c0"), ChunkHeaders::default())],
        );

        for name in ["stream.4000000000", "stream.18446744073709551615", "stream.2"] {
            let store = memory_store();
            let mut package = valid.clone();
            package.files.insert(name.to_string(), "YQ==".to_string());

            assert!(matches!(
                store.import_package(&package).await,
                Err(TvError::InconsistentCapture(_))
            ));
            assert!(!store.has(&id("abc123")).await.unwrap());
            assert!(store.read_chunk(&id("abc123"), 0).await.is_err());
        }
    }
}
