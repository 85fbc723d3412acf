//! Persisted replay record model
//!
//! Upstream documents are kept mostly opaque: the fields this crate reads or
//! rewrites are typed, everything else rides along in a flattened map so a
//! cached document serves back the same fields upstream sent.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Capture state reported by `startDownloading`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayState {
    /// Still being recorded upstream
    Live,
    /// Complete; chunk count and timing are final
    Recorded,
}

impl ReplayState {
    /// Header/JSON text of this state
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "Live",
            Self::Recorded => "Recorded",
        }
    }
}

/// One entry of the upstream listing (`find`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindEntry {
    /// Replay identifier as upstream spells it
    #[serde(rename = "_id")]
    pub id: String,
    /// Creation timestamp; number or string depending on upstream
    #[serde(default)]
    pub created: Value,
    /// Whether upstream still records this replay
    #[serde(default)]
    pub live: bool,
    /// Participants
    #[serde(default)]
    pub users: Vec<Value>,
    /// Remaining upstream fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FindEntry {
    /// Game mode, when upstream reports one
    #[must_use]
    pub fn game_mode(&self) -> Option<&str> {
        self.extra.get("gameMode").and_then(Value::as_str)
    }

    /// Map name as shown to players
    #[must_use]
    pub fn friendly_name(&self) -> Option<&str> {
        self.extra.get("friendlyName").and_then(Value::as_str)
    }

    /// Order by creation timestamp, newest first
    ///
    /// Numbers compare numerically and strings lexically; entries without a
    /// usable timestamp sort last.
    #[must_use]
    pub fn newest_first(a: &Self, b: &Self) -> Ordering {
        match (&a.created, &b.created) {
            (Value::Number(x), Value::Number(y)) => {
                let x = x.as_f64().unwrap_or(0.0);
                let y = y.as_f64().unwrap_or(0.0);
                y.partial_cmp(&x).unwrap_or(Ordering::Equal)
            }
            (Value::String(x), Value::String(y)) => y.cmp(x),
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Greater,
            (_, Value::Null) => Ordering::Less,
            (x, y) => y.to_string().cmp(&x.to_string()),
        }
    }
}

/// Replay metadata (`meta`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Game mode
    #[serde(rename = "gameMode", default, skip_serializing_if = "Option::is_none")]
    pub game_mode: Option<String>,
    /// Map name
    #[serde(rename = "mapName", default, skip_serializing_if = "Option::is_none")]
    pub map_name: Option<String>,
    /// Chunk count
    #[serde(rename = "numChunks", default)]
    pub num_chunks: u64,
    /// Whether upstream still records this replay
    #[serde(default)]
    pub live: bool,
    /// Remaining upstream fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Response of `startDownloading`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDownloading {
    /// Capture state
    pub state: ReplayState,
    /// Chunk count
    #[serde(rename = "numChunks", default)]
    pub num_chunks: u64,
    /// Replay duration as upstream reports it
    #[serde(default)]
    pub time: Value,
    /// Remaining upstream fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One named event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier
    pub id: String,
    /// Payload wrapper; the bytes live in `data.data`
    #[serde(default)]
    pub data: Value,
    /// Remaining upstream fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Decode the event payload
    ///
    /// An array of numbers is the byte sequence, a string is its UTF-8 bytes,
    /// anything else is empty.
    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        match self.data.get("data") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|n| u8::try_from(n).ok())
                .collect(),
            Some(Value::String(text)) => text.as_bytes().to_vec(),
            _ => Vec::new(),
        }
    }
}

/// An event group as served by `/replay/{id}/event`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventGroup {
    /// Events in upstream order
    #[serde(default)]
    pub events: Vec<Event>,
    /// Remaining upstream fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Name of the default event group
pub const CHECKPOINT_GROUP: &str = "checkpoint";

/// Name of the game's own event group
pub const PAVLOV_GROUP: &str = "Pavlov";

/// One captured replay, as stored in `metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    /// Listing entry
    pub find: FindEntry,
    /// `startDownloading` response
    pub start_downloading: StartDownloading,
    /// Metadata document
    pub meta: Meta,
    /// Checkpoint event group
    #[serde(default)]
    pub events: EventGroup,
    /// Game event group
    #[serde(default)]
    pub events_pavlov: EventGroup,
}

impl ReplayRecord {
    /// Whether capture of this record is complete
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.start_downloading.state == ReplayState::Recorded
    }

    /// Event group by its upstream name
    #[must_use]
    pub fn event_group(&self, group: &str) -> Option<&EventGroup> {
        match group {
            CHECKPOINT_GROUP => Some(&self.events),
            PAVLOV_GROUP => Some(&self.events_pavlov),
            _ => None,
        }
    }

    /// Every event of both groups, checkpoint group first
    pub fn all_events(&self) -> impl Iterator<Item = &Event> {
        self.events.events.iter().chain(self.events_pavlov.events.iter())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_preserves_unknown_fields() {
        let record = fixtures::record("abc", 10, false);
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["find"]["friendlyName"], "Datacenter ");
        assert_eq!(value["start_downloading"]["state"], "Recorded");
        assert_eq!(value["events"]["events"][0]["group"], "checkpoint");
        assert!(record.is_finalized());
    }

    #[test]
    fn test_upstream_field_order_survives() {
        let raw = r#"{"zone":"eu","gameMode":"SND","numChunks":4,"live":false,"banner":"b","area":1}"#;
        let meta: Meta = serde_json::from_str(raw).unwrap();
        let written = serde_json::to_string(&meta).unwrap();

        let position = |key: &str| written.find(&format!("\"{key}\"")).unwrap();
        assert!(position("zone") < position("banner"));
        assert!(position("banner") < position("area"));
    }

    #[test]
    fn test_event_payload_decoding() {
        let record = fixtures::record("abc", 10, false);
        let payloads: Vec<Vec<u8>> = record.all_events().map(Event::payload).collect();

        assert_eq!(payloads, vec![vec![1, 2, 3], vec![4, 5], b"headshot".to_vec()]);
    }

    #[test]
    fn test_event_payload_missing_is_empty() {
        let event: Event = serde_json::from_value(json!({"id": "x", "data": 5})).unwrap();
        assert!(event.payload().is_empty());
    }

    #[test]
    fn test_event_group_lookup() {
        let record = fixtures::record("abc", 10, true);
        assert_eq!(record.event_group(CHECKPOINT_GROUP).unwrap().events.len(), 2);
        assert_eq!(record.event_group(PAVLOV_GROUP).unwrap().events.len(), 1);
        assert!(record.event_group("other").is_none());
        assert!(!record.is_finalized());
    }

    #[test]
    fn test_newest_first_ordering() {
        let mut entries = vec![
            fixtures::record("a", 5, false).find,
            fixtures::record("b", 20, false).find,
            fixtures::record("c", 10, false).find,
        ];
        entries.sort_by(FindEntry::newest_first);

        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_newest_first_string_timestamps() {
        let a: FindEntry =
            serde_json::from_value(json!({"_id": "a", "created": "2024-01-01T00:00:00Z"})).unwrap();
        let b: FindEntry =
            serde_json::from_value(json!({"_id": "b", "created": "2024-06-01T00:00:00Z"})).unwrap();
        let c: FindEntry = serde_json::from_value(json!({"_id": "c"})).unwrap();

        let mut entries = vec![c, a, b];
        entries.sort_by(FindEntry::newest_first);
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }
}
