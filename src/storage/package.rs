//! Portable package of one finalized replay
//!
//! ```json
//! { "data": { "find": …, "start_downloading": …, "meta": …, "events": … },
//!   "files": { "stream.0": "<base64>", "stream.0.headers": "<base64 of json>" } }
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::blob::BlobStore;
use super::record::ReplayRecord;
use super::timing::ChunkHeaders;
use super::{chunk_file_name, parse_chunk_index, HEADER_FILE, PACKAGE_PREFIX};
use crate::{Result, TvError};

/// Version written into the package tag line
pub const PACKAGE_VERSION: u32 = 1;

/// Suffix of the per-file header entries
pub const HEADERS_SUFFIX: &str = ".headers";

/// One captured file inside a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedFile {
    /// File name, e.g. `stream.3`
    pub name: String,
    /// Raw bytes
    pub data: Bytes,
    /// Timing headers, present for chunk files
    pub headers: Option<ChunkHeaders>,
}

/// Serializable replay package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayPackage {
    /// Replay documents
    pub data: ReplayRecord,
    /// Base64 encoded files and their headers
    pub files: BTreeMap<String, String>,
}

impl ReplayPackage {
    /// Build a package from a record, its header file and its chunks
    #[must_use]
    pub fn build(
        record: ReplayRecord,
        header_file: Option<&Bytes>,
        chunks: &[(Bytes, ChunkHeaders)],
    ) -> Self {
        let mut files = BTreeMap::new();

        if let Some(header_file) = header_file {
            files.insert(HEADER_FILE.to_string(), BASE64.encode(header_file));
            files.insert(format!("{HEADER_FILE}{HEADERS_SUFFIX}"), BASE64.encode(b"{}"));
        }

        for (index, (data, headers)) in chunks.iter().enumerate() {
            let name = chunk_file_name(index as u64);
            let headers_json =
                serde_json::Value::Object(headers.to_package_json()).to_string();
            files.insert(format!("{name}{HEADERS_SUFFIX}"), BASE64.encode(headers_json));
            files.insert(name, BASE64.encode(data));
        }

        Self {
            data: record,
            files,
        }
    }

    /// Decode every file entry, pairing chunk files with their headers
    ///
    /// # Errors
    ///
    /// Returns error if an entry is not valid base64 or its headers are not JSON
    pub fn decode_files(&self) -> Result<Vec<PackagedFile>> {
        let mut decoded = Vec::new();

        for (name, encoded) in &self.files {
            if name.ends_with(HEADERS_SUFFIX) {
                continue;
            }

            let data = BASE64
                .decode(encoded)
                .map_err(|e| TvError::Other(format!("Package file {name} is not base64: {e}")))?;

            let headers = match self.files.get(&format!("{name}{HEADERS_SUFFIX}")) {
                Some(encoded) if parse_chunk_index(name).is_some() => {
                    let raw = BASE64.decode(encoded).map_err(|e| {
                        TvError::Other(format!("Package headers of {name} are not base64: {e}"))
                    })?;
                    let map: serde_json::Map<String, serde_json::Value> =
                        serde_json::from_slice(&raw)?;
                    Some(ChunkHeaders::from_package_json(&map))
                }
                _ => None,
            };

            decoded.push(PackagedFile {
                name: name.clone(),
                data: Bytes::from(data),
                headers,
            });
        }

        Ok(decoded)
    }

    /// Archive file name, `{gameMode}-{map}-{id}.pavlovtv`
    #[must_use]
    pub fn file_name(&self) -> String {
        let game_mode = self.data.meta.game_mode.as_deref().unwrap_or("unknown");
        let map = self
            .data
            .find
            .friendly_name()
            .or(self.data.meta.map_name.as_deref())
            .unwrap_or("unknown");

        format!(
            "{}-{}-{}.pavlovtv",
            sanitize(game_mode),
            sanitize(map.trim()),
            sanitize(&self.data.find.id)
        )
    }

    /// Serialize with the one-line plaintext tag in front
    ///
    /// # Errors
    ///
    /// Returns error if the package cannot be serialized
    pub fn to_tagged_bytes(&self, origin: &str) -> Result<Vec<u8>> {
        let mut out = format!("{PACKAGE_VERSION} {origin}\n").into_bytes();
        serde_json::to_writer(&mut out, self)?;
        Ok(out)
    }

    /// Parse bytes produced by [`ReplayPackage::to_tagged_bytes`]
    ///
    /// # Errors
    ///
    /// Returns error if the tag line is missing or the body is not a package
    pub fn from_tagged_bytes(raw: &[u8]) -> Result<(String, Self)> {
        let newline = raw
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| TvError::Other("Package has no tag line".to_string()))?;

        let tag = String::from_utf8_lossy(&raw[..newline]).to_string();
        let package = serde_json::from_slice(&raw[newline + 1..])?;
        Ok((tag, package))
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Destination of finished packages
///
/// This is where sealing (encryption) and shipping to other machines plug in.
#[async_trait]
pub trait PackageSink: Send + Sync {
    /// Accept one finished package
    async fn deliver(&self, package: &ReplayPackage) -> Result<()>;
}

/// Sink that keeps tagged packages under `_packages/` of a blob store
pub struct ArchiveSink<S: ?Sized> {
    store: std::sync::Arc<S>,
    origin: String,
}

impl<S: BlobStore + ?Sized> ArchiveSink<S> {
    /// Create a sink writing into `store`
    pub fn new(store: std::sync::Arc<S>, origin: impl Into<String>) -> Self {
        Self {
            store,
            origin: origin.into(),
        }
    }

    /// Key a package is archived under
    #[must_use]
    pub fn key_for(package: &ReplayPackage) -> String {
        format!("{PACKAGE_PREFIX}/{}", package.file_name())
    }
}

#[async_trait]
impl<S: BlobStore + ?Sized> PackageSink for ArchiveSink<S> {
    async fn deliver(&self, package: &ReplayPackage) -> Result<()> {
        let key = Self::key_for(package);
        let bytes = package.to_tagged_bytes(&self.origin)?;
        self.store.put(&key, Bytes::from(bytes)).await?;
        info!("Archived package {}", key);
        Ok(())
    }
}
