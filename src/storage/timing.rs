//! Per-chunk timing headers
//!
//! Every value is opaque text. Upstream sends these as HTTP header strings
//! and the game client expects them back as header strings, so nothing here
//! is ever parsed into a number and re-rendered.

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Synthesized response headers of one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeaders {
    /// Chunk count upstream reported when this chunk was fetched
    #[serde(default, deserialize_with = "opaque_text")]
    pub numchunks: Option<String>,
    /// Replay time upstream reported
    #[serde(default, deserialize_with = "opaque_text")]
    pub time: Option<String>,
    /// `Live` or `Recorded`
    #[serde(default, deserialize_with = "opaque_text")]
    pub state: Option<String>,
    /// First modification timestamp
    #[serde(default, deserialize_with = "opaque_text")]
    pub mtime1: Option<String>,
    /// Second modification timestamp
    #[serde(default, deserialize_with = "opaque_text")]
    pub mtime2: Option<String>,
}

/// Accept a string, number or null and keep it as text
fn opaque_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text)),
        Value::Number(number) => Ok(Some(number.to_string())),
        Value::Bool(flag) => Ok(Some(flag.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected header text, got {other}"
        ))),
    }
}

impl ChunkHeaders {
    /// Capture the timing headers of an upstream chunk response
    #[must_use]
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Self {
            numchunks: text("numchunks"),
            time: text("time"),
            state: text("state"),
            mtime1: text("mtime1"),
            mtime2: text("mtime2"),
        }
    }

    /// Whether no header was captured at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|(_, value)| value.is_none())
    }

    /// `(name, value)` pairs in serving order
    #[must_use]
    pub fn fields(&self) -> [(&'static str, Option<&str>); 5] {
        [
            ("numchunks", self.numchunks.as_deref()),
            ("time", self.time.as_deref()),
            ("state", self.state.as_deref()),
            ("mtime1", self.mtime1.as_deref()),
            ("mtime2", self.mtime2.as_deref()),
        ]
    }

    /// Insert the present values into a response header map
    ///
    /// Values that are not valid header text are skipped.
    pub fn apply_to(&self, headers: &mut HeaderMap) {
        for (name, value) in self.fields() {
            let Some(value) = value else { continue };
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
    }

    /// Package form: title-cased names, absent values omitted
    #[must_use]
    pub fn to_package_json(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        let titled = [
            ("MTime1", &self.mtime1),
            ("MTime2", &self.mtime2),
            ("NumChunks", &self.numchunks),
            ("State", &self.state),
            ("Time", &self.time),
        ];
        for (name, value) in titled {
            if let Some(value) = value {
                map.insert(name.to_string(), Value::String(value.clone()));
            }
        }
        map
    }

    /// Read back the package form; names match case-insensitively
    #[must_use]
    pub fn from_package_json(map: &serde_json::Map<String, Value>) -> Self {
        let text = |name: &str| {
            map.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .and_then(|(_, value)| match value {
                    Value::String(text) => Some(text.clone()),
                    Value::Number(number) => Some(number.to_string()),
                    _ => None,
                })
        };

        Self {
            numchunks: text("numchunks"),
            time: text("time"),
            state: text("state"),
            mtime1: text("mtime1"),
            mtime2: text("mtime2"),
        }
    }
}
