//! Serving side: answers the upstream read API from stored replays

mod engine;
mod events;
mod manifest;

pub use engine::DecisionEngine;
pub use events::{gzip, EventIndex};
pub use manifest::{CacheManifest, ListQuery};
