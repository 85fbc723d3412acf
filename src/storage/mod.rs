//! Replay storage: identifiers, persisted model and on-disk layout
//!
//! ```text
//! {id}/metadata.json   record document, written last
//! {id}/replay.header   header file
//! {id}/stream.{n}      chunk files
//! {id}/timing.json     per-chunk headers, aligned with chunk index
//! _claims/{id}.json    capture claims
//! _packages/…          archived packages
//! ```

mod blob;
mod id;
mod package;
mod record;
mod store;
mod timing;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use id::{ReplayId, REPLAY_ID_MAX_LEN};
pub use package::{
    ArchiveSink, PackageSink, PackagedFile, ReplayPackage, HEADERS_SUFFIX, PACKAGE_VERSION,
};
pub use record::{
    Event, EventGroup, FindEntry, Meta, ReplayRecord, ReplayState, StartDownloading,
    CHECKPOINT_GROUP, PAVLOV_GROUP,
};
pub use store::{validate_file_name, ReplayStore, StoredChunk};
pub use timing::ChunkHeaders;

#[cfg(test)]
pub(crate) use record::fixtures;

/// Record document name
pub const METADATA_FILE: &str = "metadata.json";

/// Timing document name
pub const TIMING_FILE: &str = "timing.json";

/// Header file name
pub const HEADER_FILE: &str = "replay.header";

/// Prefix of chunk file names
pub const CHUNK_PREFIX: &str = "stream.";

/// Blob prefix holding capture claims
pub const CLAIM_PREFIX: &str = "_claims";

/// Blob prefix holding archived packages
pub const PACKAGE_PREFIX: &str = "_packages";

/// File name of chunk `index`
#[must_use]
pub fn chunk_file_name(index: u64) -> String {
    format!("{CHUNK_PREFIX}{index}")
}

/// Chunk index of a file name, `None` for non-chunk files
#[must_use]
pub fn parse_chunk_index(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(CHUNK_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
