//! Capture of one replay from upstream, extended until upstream stops
//! recording
//!
//! ```text
//! Capturing ──(initial state Recorded)──────────────► Finalized
//!     │                                                  ▲
//!     └──(initial state Live)──► LiveExtending ──rewrite─┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{CaptureConfig, Config, DEFAULT_UPSTREAM_TIMEOUT_MS};
use crate::network::{Upstream, UpstreamRequest, UpstreamResponse};
use crate::storage::{
    chunk_file_name, parse_chunk_index, ArchiveSink, ChunkHeaders, EventGroup, FindEntry, Meta,
    PackageSink, ReplayId, ReplayPackage, ReplayRecord, ReplayState, ReplayStore,
    StartDownloading, HEADER_FILE, PAVLOV_GROUP,
};
use crate::{Result, TvError};

use super::claim::{CaptureLock, ClaimOutcome};
use super::rewrite::{finalize_headers, Confirmed};

/// Retry policy of the live extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePolicy {
    /// Pause before retrying an unavailable chunk
    pub retry_backoff: Duration,
    /// Give up once this long has passed since the last fetched chunk
    pub idle_timeout: Duration,
    /// Limit on reading one response body
    pub body_timeout: Duration,
}

impl CapturePolicy {
    /// Policy from the `[capture]` section; bodies share the upstream call timeout
    #[must_use]
    pub fn from_config(capture: &CaptureConfig, upstream_timeout: Duration) -> Self {
        Self {
            retry_backoff: capture.retry_backoff(),
            idle_timeout: capture.idle_timeout(),
            body_timeout: upstream_timeout,
        }
    }
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self::from_config(
            &CaptureConfig::default(),
            Duration::from_millis(DEFAULT_UPSTREAM_TIMEOUT_MS),
        )
    }
}

/// Outcome of one finished capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    /// Captured replay
    pub id: ReplayId,
    /// State upstream reported when the capture started
    pub initial_state: ReplayState,
    /// Chunks persisted
    pub chunks: u64,
    /// Rewrite result; `None` when upstream had already finished recording
    pub confirmed: Option<Confirmed>,
    /// Name of the delivered package
    pub package: String,
}

#[derive(Deserialize)]
struct Listing {
    #[serde(default)]
    replays: Vec<FindEntry>,
}

/// Claims replays and captures them into the store
pub struct Finalizer {
    store: ReplayStore,
    upstream: Arc<dyn Upstream>,
    lock: CaptureLock,
    sink: Arc<dyn PackageSink>,
    policy: CapturePolicy,
    find_path: String,
}

impl Finalizer {
    /// Create a finalizer; claims live beside the replays in `store`
    #[must_use]
    pub fn new(
        store: ReplayStore,
        upstream: Arc<dyn Upstream>,
        sink: Arc<dyn PackageSink>,
        policy: CapturePolicy,
        find_path: impl Into<String>,
    ) -> Self {
        let lock = CaptureLock::new(Arc::clone(store.blobs()));
        Self {
            store,
            upstream,
            lock,
            sink,
            policy,
            find_path: find_path.into(),
        }
    }

    /// Create a finalizer that archives packages into the store
    #[must_use]
    pub fn from_config(config: &Config, store: ReplayStore, upstream: Arc<dyn Upstream>) -> Self {
        let sink = Arc::new(ArchiveSink::new(
            Arc::clone(store.blobs()),
            config.capture.origin_tag.clone(),
        ));
        Self::new(
            store,
            upstream,
            sink,
            CapturePolicy::from_config(&config.capture, config.upstream.timeout()),
            config.capture.find_path.clone(),
        )
    }

    /// Claim lock used before every capture
    #[must_use]
    pub fn lock(&self) -> &CaptureLock {
        &self.lock
    }

    /// Capture the first unclaimed replay of the upstream listing
    ///
    /// Entries without participants or with malformed ids are skipped.
    /// Returns `None` when every eligible replay is already claimed.
    ///
    /// # Errors
    ///
    /// Returns error if the listing cannot be read, or the capture fails
    /// after the claim was taken
    pub async fn run_once(&self) -> Result<Option<CaptureReport>> {
        for entry in self.fetch_listing().await? {
            if entry.users.is_empty() {
                continue;
            }

            let id = match ReplayId::parse(&entry.id) {
                Ok(id) => id,
                Err(e) => {
                    warn!("Skipping listing entry: {}", e);
                    continue;
                }
            };

            match self.lock.try_claim(&id).await? {
                ClaimOutcome::AlreadyClaimed => continue,
                ClaimOutcome::Claimed => return self.capture(id, entry).await.map(Some),
            }
        }

        debug!("No unclaimed replay to capture");
        Ok(None)
    }

    /// Claim and capture one named replay
    ///
    /// Returns `None` when the replay is already claimed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for a malformed id, `NotFound` when the
    /// upstream listing no longer has the replay, or a capture error
    pub async fn capture_id(&self, id: &str) -> Result<Option<CaptureReport>> {
        let id = ReplayId::parse(id)?;

        let entry = self
            .fetch_listing()
            .await?
            .into_iter()
            .find(|entry| entry.id == id.as_str())
            .ok_or_else(|| TvError::NotFound(format!("replay {id} is not listed upstream")))?;

        match self.lock.try_claim(&id).await? {
            ClaimOutcome::AlreadyClaimed => Ok(None),
            ClaimOutcome::Claimed => self.capture(id, entry).await.map(Some),
        }
    }

    /// Run [`Finalizer::run_once`] every `interval` until shutdown
    pub async fn run_periodically(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(Some(report)) => info!(
                            "Captured {} ({} chunks) into {}",
                            report.id, report.chunks, report.package
                        ),
                        Ok(None) => {}
                        Err(e) => error!("Capture trigger failed: {}", e),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Capture trigger shutting down");
                    break;
                }
            }
        }
    }

    async fn capture(&self, id: ReplayId, find: FindEntry) -> Result<CaptureReport> {
        info!("Capturing {}", id);
        let mut record = self.capture_initial(&id, find).await?;
        let initial_state = record.start_downloading.state;
        let initial_chunks = record.start_downloading.num_chunks;

        // Persisted as Recorded so a partial capture never reads as live
        record.start_downloading.state = ReplayState::Recorded;
        self.store.write_record(&id, &record).await?;

        let confirmed = if initial_state == ReplayState::Recorded {
            None
        } else {
            info!("{} is live, extending past chunk {}", id, initial_chunks);
            self.extend_live(&id, initial_chunks).await?;

            let mut timing = self.store.read_timing(&id).await?;
            let confirmed = finalize_headers(&mut record, &mut timing)?;
            self.store.write_timing(&id, &timing).await?;
            self.store.write_record(&id, &record).await?;
            Some(confirmed)
        };

        let package = self.package(&id, record).await?;
        let chunks = package
            .files
            .keys()
            .filter(|name| parse_chunk_index(name).is_some())
            .count() as u64;
        self.sink.deliver(&package).await?;

        info!("Finalized {} with {} chunks", id, chunks);
        Ok(CaptureReport {
            id,
            initial_state,
            chunks,
            confirmed,
            package: package.file_name(),
        })
    }

    /// Fetch documents, header file and the chunks upstream announced
    async fn capture_initial(&self, id: &ReplayId, find: FindEntry) -> Result<ReplayRecord> {
        let start_downloading: StartDownloading = self
            .fetch_json(UpstreamRequest::post(format!(
                "/replay/{id}/startDownloading?user"
            )))
            .await?;
        let meta: Meta = self
            .fetch_json(UpstreamRequest::get(format!("/meta/{id}")))
            .await?;
        let events: EventGroup = self
            .fetch_json(UpstreamRequest::get(format!("/replay/{id}/event")))
            .await?;

        let events_pavlov = match self
            .fetch_json(
                UpstreamRequest::get(format!("/replay/{id}/event")).with_query("group", PAVLOV_GROUP),
            )
            .await
        {
            Ok(group) => group,
            Err(TvError::NotFound(_)) => {
                debug!("{} has no {} events", id, PAVLOV_GROUP);
                EventGroup::default()
            }
            Err(e) => return Err(e),
        };

        let header = self
            .fetch(UpstreamRequest::get(format!("/replay/{id}/file/{HEADER_FILE}")))
            .await?
            .bytes_within(self.policy.body_timeout)
            .await?;
        self.store.write_file(id, HEADER_FILE, header).await?;

        for index in 0..start_downloading.num_chunks {
            let (data, headers) = self.fetch_chunk(id, index).await?;
            self.store.write_chunk(id, index, data, headers).await?;
        }
        debug!(
            "Captured {} initial chunks of {}",
            start_downloading.num_chunks, id
        );

        Ok(ReplayRecord {
            find,
            start_downloading,
            meta,
            events,
            events_pavlov,
        })
    }

    /// Poll chunks from `next` until upstream reports `Recorded` or the
    /// idle timeout passes without a new chunk
    async fn extend_live(&self, id: &ReplayId, mut next: u64) -> Result<()> {
        let mut last_success = Instant::now();

        loop {
            match self.fetch_chunk(id, next).await {
                Ok((data, headers)) => {
                    let finished =
                        headers.state.as_deref() == Some(ReplayState::Recorded.as_str());
                    self.store.write_chunk(id, next, data, headers).await?;
                    debug!("Extended {} with chunk {}", id, next);

                    next += 1;
                    last_success = Instant::now();

                    if finished {
                        info!("{} finished recording at chunk {}", id, next - 1);
                        return Ok(());
                    }
                }
                Err(e) => {
                    if last_success.elapsed() >= self.policy.idle_timeout {
                        warn!(
                            "{} idle for {:?}, treating chunk {} as the last",
                            id,
                            self.policy.idle_timeout,
                            next.saturating_sub(1)
                        );
                        return Ok(());
                    }
                    debug!("Chunk {} of {} unavailable ({}), retrying", next, id, e);
                    tokio::time::sleep(self.policy.retry_backoff).await;
                }
            }
        }
    }

    async fn package(&self, id: &ReplayId, record: ReplayRecord) -> Result<ReplayPackage> {
        let header = self.store.read_file(id, HEADER_FILE).await?;
        let timing = self.store.read_timing(id).await?;

        let mut chunks = Vec::with_capacity(timing.len());
        for (index, headers) in timing.into_iter().enumerate() {
            let chunk = self.store.read_chunk(id, index as u64).await?;
            chunks.push((chunk.data, headers));
        }

        Ok(ReplayPackage::build(record, header.as_ref(), &chunks))
    }

    async fn fetch_listing(&self) -> Result<Vec<FindEntry>> {
        let listing: Listing = self
            .fetch_json(UpstreamRequest::get(self.find_path.clone()))
            .await?;
        Ok(listing.replays)
    }

    async fn fetch_chunk(&self, id: &ReplayId, index: u64) -> Result<(Bytes, ChunkHeaders)> {
        let response = self
            .fetch(UpstreamRequest::get(format!(
                "/replay/{id}/file/{}",
                chunk_file_name(index)
            )))
            .await?;
        let headers = ChunkHeaders::from_header_map(&response.headers);
        let data = response.bytes_within(self.policy.body_timeout).await?;
        Ok((data, headers))
    }

    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let what = request.path().to_string();
        self.upstream.send(request).await?.error_for_status(&what)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, request: UpstreamRequest) -> Result<T> {
        let raw = self
            .fetch(request)
            .await?
            .bytes_within(self.policy.body_timeout)
            .await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}
