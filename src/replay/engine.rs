//! Cache-or-proxy decision for every emulated upstream endpoint
//!
//! Each operation validates the replay id before touching storage, answers
//! from the [`ReplayStore`] when a complete record exists, and otherwise
//! relays the upstream response for the same path without buffering it.

use std::sync::Arc;

use hyper::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use hyper::StatusCode;
use serde_json::json;
use tracing::{debug, info};

use crate::config::Config;
use crate::network::{Upstream, UpstreamRequest};
use crate::proxy::{relay, Origin, Reply};
use crate::storage::{
    parse_chunk_index, validate_file_name, ChunkHeaders, ReplayId, ReplayRecord, ReplayStore,
    CHECKPOINT_GROUP,
};
use crate::{Result, TvError};

use super::events::{gzip, EventIndex};
use super::manifest::{CacheManifest, ListQuery};

/// Serves the upstream read API from the store, falling back to upstream
pub struct DecisionEngine {
    store: ReplayStore,
    upstream: Arc<dyn Upstream>,
    index: Arc<EventIndex>,
    manifest: CacheManifest,
    page_size: usize,
}

impl DecisionEngine {
    /// Create an engine
    #[must_use]
    pub fn new(
        store: ReplayStore,
        upstream: Arc<dyn Upstream>,
        index: Arc<EventIndex>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            upstream,
            index,
            manifest: CacheManifest::new(),
            page_size,
        }
    }

    /// Create an engine with index scope and page size taken from `config`
    #[must_use]
    pub fn from_config(config: &Config, store: ReplayStore, upstream: Arc<dyn Upstream>) -> Self {
        Self::new(
            store,
            upstream,
            Arc::new(EventIndex::new(config.event_index.scope)),
            config.listing.page_size,
        )
    }

    /// Backing replay store
    #[must_use]
    pub fn store(&self) -> &ReplayStore {
        &self.store
    }

    /// Event index fed by `startDownloading`
    #[must_use]
    pub fn event_index(&self) -> &Arc<EventIndex> {
        &self.index
    }

    /// `GET /find/any` and `GET /find/?…`
    ///
    /// Served from the cache manifest once anything is stored, proxied
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be listed or upstream is unreachable
    pub async fn list(&self, path_and_query: &str, query: Option<&str>) -> Result<Reply> {
        self.manifest.refresh(&self.store).await?;

        if self.manifest.is_empty().await {
            return self.forward(UpstreamRequest::get(path_and_query)).await;
        }

        let query = ListQuery::from_query(query);
        let replays = self.manifest.page(&query, self.page_size).await;
        debug!("Listing {} cached replays", replays.len());
        Reply::json(StatusCode::OK, &json!({ "replays": replays }), Origin::Store)
    }

    /// `GET /meta/{id}`
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for a malformed id, or a storage/upstream error
    pub async fn meta(&self, id: &str, path_and_query: &str) -> Result<Reply> {
        let id = ReplayId::parse(id)?;

        match self.stored_record(&id).await? {
            Some(record) => {
                debug!("Cache hit: meta {}", id);
                Reply::json(StatusCode::OK, &record.meta, Origin::Store)
            }
            None => self.forward(UpstreamRequest::get(path_and_query)).await,
        }
    }

    /// `GET /replay/{id}/file/{name}`
    ///
    /// Chunk files carry their timing headers when a timing entry exists.
    /// A stored record missing the requested file falls back to upstream
    /// with the timing headers laid over the relayed ones.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for a malformed id or file name, or a
    /// storage/upstream error
    pub async fn file(&self, id: &str, name: &str, path_and_query: &str) -> Result<Reply> {
        let id = ReplayId::parse(id)?;
        validate_file_name(name)?;

        if !self.store.has(&id).await? {
            return self.forward(UpstreamRequest::get(path_and_query)).await;
        }

        let headers = self.chunk_headers(&id, name).await?;
        let mut reply = if let Some(data) = self.store.read_file(&id, name).await? {
            debug!("Cache hit: {} file {}", id, name);
            Reply::bytes(StatusCode::OK, data, Origin::Store)
        } else {
            debug!("Stored {} lacks {}, proxying", id, name);
            self.forward(UpstreamRequest::get(path_and_query)).await?
        };

        if let Some(headers) = headers {
            headers.apply_to(&mut reply.headers);
        }
        Ok(reply)
    }

    async fn chunk_headers(&self, id: &ReplayId, name: &str) -> Result<Option<ChunkHeaders>> {
        match parse_chunk_index(name) {
            Some(index) => self.store.timing_entry(id, index).await,
            None => Ok(None),
        }
    }

    /// `GET /replay/{id}/event[?group=]`
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for a malformed id, `InvalidGroup` for an
    /// unknown group of a stored record, or a storage/upstream error
    pub async fn events(
        &self,
        id: &str,
        group: Option<&str>,
        path_and_query: &str,
    ) -> Result<Reply> {
        let id = ReplayId::parse(id)?;

        let Some(record) = self.stored_record(&id).await? else {
            return self.forward(UpstreamRequest::get(path_and_query)).await;
        };

        let group = group.unwrap_or(CHECKPOINT_GROUP);
        let events = record
            .event_group(group)
            .ok_or_else(|| TvError::InvalidGroup(group.to_string()))?;

        debug!("Cache hit: {} events of {}", group, id);
        Reply::json(StatusCode::OK, events, Origin::Store)
    }

    /// `POST /replay/{id}/startDownloading?user=`
    ///
    /// Rebuilds the event index for the replay as a side effect. On a miss
    /// the index is rebuilt (or cleared) once upstream has answered.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for a malformed id, or a storage/upstream error
    pub async fn start_downloading(&self, id: &str, path_and_query: &str) -> Result<Reply> {
        let id = ReplayId::parse(id)?;

        if let Some(record) = self.stored_record(&id).await? {
            info!("Serving stored download of {}", id);
            self.index.rebuild(&id, &record);
            return Reply::json(StatusCode::OK, &record.start_downloading, Origin::Store);
        }

        let reply = self.forward(UpstreamRequest::post(path_and_query)).await?;

        match self.stored_record(&id).await? {
            Some(record) => self.index.rebuild(&id, &record),
            None => self.index.invalidate(&id),
        }

        Ok(reply)
    }

    /// `POST /replay/{id}/viewer/{viewer}`
    ///
    /// Heartbeats for stored replays are acknowledged locally.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for a malformed id, or a storage/upstream error
    pub async fn viewer(&self, id: &str, path_and_query: &str) -> Result<Reply> {
        let id = ReplayId::parse(id)?;

        if self.store.has(&id).await? {
            return Ok(Reply::empty(StatusCode::NO_CONTENT, Origin::Local));
        }

        self.forward(UpstreamRequest::post(path_and_query)).await
    }

    /// `GET /event/{eventId}`: one indexed payload, gzip-encoded
    ///
    /// # Errors
    ///
    /// Returns error if compression fails
    pub async fn event(&self, event_id: &str) -> Result<Reply> {
        let payload = match self.index.lookup(event_id) {
            Ok(payload) => payload,
            Err(TvError::NotFound(_)) => {
                debug!("Event {} not indexed", event_id);
                return Ok(Reply::bytes(
                    StatusCode::NOT_FOUND,
                    "Event data not found",
                    Origin::Local,
                ));
            }
            Err(e) => return Err(e),
        };

        let mut reply = Reply::bytes(StatusCode::OK, gzip(&payload)?, Origin::Store);
        reply.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        reply
            .headers
            .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        Ok(reply)
    }

    async fn stored_record(&self, id: &ReplayId) -> Result<Option<ReplayRecord>> {
        match self.store.read_record(id).await {
            Ok(record) => Ok(Some(record)),
            Err(TvError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn forward(&self, request: UpstreamRequest) -> Result<Reply> {
        debug!("Cache miss, proxying {} {}", request.method, request.path_and_query);
        let response = self.upstream.send(request).await?;
        Ok(relay(response))
    }
}
