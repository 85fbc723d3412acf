//! Replay identifiers

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{Result, TvError};

/// Maximum identifier length accepted
pub const REPLAY_ID_MAX_LEN: usize = 128;

/// Validated replay identifier
///
/// Only ASCII alphanumerics are accepted, so an id can be joined into a
/// storage key without any escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ReplayId(String);

impl ReplayId {
    /// Validate and wrap an identifier
    ///
    /// # Errors
    ///
    /// Returns `InvalidIdentifier` for empty, overlong or non-alphanumeric input
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.len() > REPLAY_ID_MAX_LEN {
            return Err(TvError::InvalidIdentifier(raw.to_string()));
        }

        if !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(TvError::InvalidIdentifier(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    /// Borrow the identifier text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ReplayId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ReplayId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
