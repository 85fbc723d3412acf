//! Single-flight claims on replays

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{BlobStore, ReplayId, CLAIM_PREFIX};
use crate::Result;

/// Durable marker excluding concurrent captures of one replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureClaim {
    /// Claimed replay
    pub replay_id: ReplayId,
    /// Claim time, seconds since the Unix epoch
    pub claimed_at_epoch_seconds: u64,
}

/// Result of [`CaptureLock::try_claim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The marker was written by this call
    Claimed,
    /// A marker already existed
    AlreadyClaimed,
}

/// Best-effort exclusion through marker blobs under `_claims/`
///
/// Check-then-write: two racing claimants may both succeed. Claims are
/// never released or expired.
pub struct CaptureLock {
    blobs: Arc<dyn BlobStore>,
}

impl CaptureLock {
    /// Create a lock over a blob backend
    #[must_use]
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Claim `id` unless a marker already exists
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn try_claim(&self, id: &ReplayId) -> Result<ClaimOutcome> {
        let key = claim_key(id);

        if self.blobs.exists(&key).await? {
            debug!("Replay {} already claimed", id);
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let claim = CaptureClaim {
            replay_id: id.clone(),
            claimed_at_epoch_seconds: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_secs()),
        };
        self.blobs
            .put(&key, Bytes::from(serde_json::to_vec(&claim)?))
            .await?;

        info!("Claimed replay {}", id);
        Ok(ClaimOutcome::Claimed)
    }

    /// Whether `id` carries a claim marker
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn is_claimed(&self, id: &ReplayId) -> Result<bool> {
        self.blobs.exists(&claim_key(id)).await
    }

    /// Read the claim marker of `id`
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails or the marker is malformed
    pub async fn read_claim(&self, id: &ReplayId) -> Result<Option<CaptureClaim>> {
        match self.blobs.get(&claim_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }
}

fn claim_key(id: &ReplayId) -> String {
    format!("{CLAIM_PREFIX}/{id}.json")
}
