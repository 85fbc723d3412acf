//! Listing of locally stored replays

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::storage::{FindEntry, ReplayId, ReplayStore};
use crate::Result;

/// Listing filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Game mode filter; `None` or `all` lists every mode
    pub game: Option<String>,
    /// Entries to skip after ordering and filtering
    pub offset: usize,
}

impl ListQuery {
    /// Parse `game` and `offset` out of a raw query string
    ///
    /// Unknown keys (`shack`, `live`) are ignored. An unparseable offset is 0.
    #[must_use]
    pub fn from_query(query: Option<&str>) -> Self {
        let mut parsed = Self::default();

        for pair in query.unwrap_or_default().split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());

            match key {
                "game" => parsed.game = Some(value),
                "offset" => parsed.offset = value.parse().unwrap_or(0),
                _ => {}
            }
        }

        parsed
    }

    fn matches(&self, entry: &FindEntry) -> bool {
        match self.game.as_deref() {
            None | Some("" | "all") => true,
            Some(game) => entry
                .game_mode()
                .is_some_and(|mode| mode.eq_ignore_ascii_case(game)),
        }
    }
}

/// Listing entries of every stored record
///
/// Advisory: refreshed from the store before each listing, concurrent
/// refreshes race harmlessly.
#[derive(Default)]
pub struct CacheManifest {
    entries: RwLock<BTreeMap<ReplayId, FindEntry>>,
}

impl CacheManifest {
    /// Create an empty manifest
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the manifest in line with the store
    ///
    /// Every stored record's listing entry is re-read, so a record rewritten
    /// in place (a capture that finished) is listed as it now stands. Ids no
    /// longer stored are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be listed
    pub async fn refresh(&self, store: &ReplayStore) -> Result<()> {
        let stored = store.list_replay_ids().await?;

        let mut fresh = BTreeMap::new();
        for id in stored {
            match store.read_record(&id).await {
                Ok(record) => {
                    fresh.insert(id, record.find);
                }
                Err(e) => warn!("Skipping {} in manifest: {}", id, e),
            }
        }

        let mut entries = self.entries.write().await;
        let dropped = entries.keys().filter(|id| !fresh.contains_key(*id)).count();
        if dropped > 0 {
            debug!("Dropped {} stale manifest entries", dropped);
        }
        *entries = fresh;

        Ok(())
    }

    /// Number of listed replays
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing is listed
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Ordered, filtered page of entries
    ///
    /// Entries are ordered newest first; the filter and `offset` apply after
    /// ordering.
    pub async fn page(&self, query: &ListQuery, page_size: usize) -> Vec<FindEntry> {
        let mut entries: Vec<FindEntry> = self.entries.read().await.values().cloned().collect();
        entries.sort_by(FindEntry::newest_first);

        entries
            .into_iter()
            .filter(|entry| query.matches(entry))
            .skip(query.offset)
            .take(page_size)
            .collect()
    }
}
