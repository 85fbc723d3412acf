//! In-memory index of event payloads

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;
use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::config::IndexScope;
use crate::storage::{ReplayId, ReplayRecord};
use crate::{Result, TvError};

/// Event payloads keyed by `(replay, event id)`
///
/// Entries are only ever replaced wholesale by [`EventIndex::rebuild`].
/// With [`IndexScope::Single`] a rebuild drops every other replay's entries,
/// so the index always reflects the most recently started download.
pub struct EventIndex {
    scope: IndexScope,
    entries: DashMap<(ReplayId, String), Bytes>,
    latest: RwLock<Option<ReplayId>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl EventIndex {
    /// Create an empty index
    #[must_use]
    pub fn new(scope: IndexScope) -> Self {
        Self {
            scope,
            entries: DashMap::new(),
            latest: RwLock::new(None),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Replace the entries in `id`'s scope with the events of `record`
    pub fn rebuild(&self, id: &ReplayId, record: &ReplayRecord) {
        self.clear_scope(id);

        let mut count = 0;
        for event in record.all_events() {
            self.entries
                .insert((id.clone(), event.id.clone()), Bytes::from(event.payload()));
            count += 1;
        }

        debug!("Indexed {} events of {}", count, id);
    }

    /// Clear `id`'s scope without repopulating it
    ///
    /// Used when a download starts for a replay that is not stored locally.
    pub fn invalidate(&self, id: &ReplayId) {
        self.clear_scope(id);
        debug!("Invalidated event index for {}", id);
    }

    fn clear_scope(&self, id: &ReplayId) {
        match self.scope {
            IndexScope::Single => self.entries.clear(),
            IndexScope::PerReplay => self.entries.retain(|(replay, _), _| replay != id),
        }
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
    }

    /// Look up an event payload
    ///
    /// The most recently rebuilt replay is searched first. In per-replay
    /// scope every other indexed replay is searched after it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no indexed replay holds `event_id`
    pub fn lookup(&self, event_id: &str) -> Result<Bytes> {
        let latest = self
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let found = latest
            .and_then(|id| self.get(&id, event_id))
            .or_else(|| match self.scope {
                IndexScope::Single => None,
                IndexScope::PerReplay => self
                    .entries
                    .iter()
                    .find(|entry| entry.key().1 == event_id)
                    .map(|entry| entry.value().clone()),
            });

        self.count(found, event_id)
    }

    /// Look up an event payload within one replay
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the event is not indexed for `id`
    pub fn lookup_in(&self, id: &ReplayId, event_id: &str) -> Result<Bytes> {
        let found = self.get(id, event_id);
        self.count(found, event_id)
    }

    fn get(&self, id: &ReplayId, event_id: &str) -> Option<Bytes> {
        self.entries
            .get(&(id.clone(), event_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    fn count(&self, found: Option<Bytes>, event_id: &str) -> Result<Bytes> {
        if let Some(payload) = found {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Ok(payload)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Err(TvError::NotFound(format!("event {event_id}")))
        }
    }

    /// Number of indexed events
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is indexed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get lookup hit count
    #[must_use]
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get lookup miss count
    #[must_use]
    pub fn miss_count(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for EventIndex {
    fn default() -> Self {
        Self::new(IndexScope::default())
    }
}

/// Gzip-compress an event payload for transmission
///
/// # Errors
///
/// Returns error if the encoder fails
pub fn gzip(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}
