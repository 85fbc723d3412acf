//! Rewrite of live-captured headers into a finished recording

use serde_json::Value;
use tracing::debug;

use crate::storage::{ChunkHeaders, ReplayRecord, ReplayState};
use crate::{Result, TvError};

/// Final chunk count and time established by the rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmed {
    /// Chunk count
    pub chunks: u64,
    /// Chunk count exactly as upstream spelled it
    pub num_chunks_text: String,
    /// Replay time as upstream spelled it, if known
    pub time: Option<String>,
}

/// Rewrite every timing entry and the record to one consistent finished state
///
/// The final values come from the last timing entry, the one of the last
/// chunk fetched successfully. Every entry gets that chunk count and time
/// with state `Recorded`; the record's counts, time and live flags follow.
/// Header values are copied as text and never re-rendered from numbers, so
/// applying the rewrite twice changes nothing.
///
/// # Errors
///
/// Returns `InconsistentCapture` if there is no timing entry or the last one
/// carries no parseable chunk count
pub fn finalize_headers(record: &mut ReplayRecord, timing: &mut [ChunkHeaders]) -> Result<Confirmed> {
    let last = timing.last().ok_or_else(|| {
        TvError::InconsistentCapture(format!("{}: no chunk was captured", record.find.id))
    })?;

    let num_chunks_text = last
        .numchunks
        .clone()
        .ok_or_else(|| {
            TvError::InconsistentCapture(format!(
                "{}: last chunk reported no chunk count",
                record.find.id
            ))
        })?;

    let chunks = num_chunks_text.trim().parse::<u64>().map_err(|_| {
        TvError::InconsistentCapture(format!(
            "{}: unparseable chunk count {num_chunks_text:?}",
            record.find.id
        ))
    })?;

    let time = last.time.clone().or_else(|| match &record.start_downloading.time {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    });

    for entry in timing.iter_mut() {
        entry.numchunks = Some(num_chunks_text.clone());
        entry.time.clone_from(&time);
        entry.state = Some(ReplayState::Recorded.as_str().to_string());
    }

    record.meta.num_chunks = chunks;
    record.meta.live = false;
    record.find.live = false;
    record.start_downloading.num_chunks = chunks;
    record.start_downloading.state = ReplayState::Recorded;
    if let Some(time) = &time {
        record.start_downloading.time = typed_like(&record.start_downloading.time, time);
    }

    debug!(
        "Rewrote {} timing entries of {} to {} chunks",
        timing.len(),
        record.find.id,
        chunks
    );

    Ok(Confirmed {
        chunks,
        num_chunks_text,
        time,
    })
}

/// Keep the JSON type upstream used for a value
fn typed_like(previous: &Value, text: &str) -> Value {
    if previous.is_number() {
        if let Ok(n) = text.trim().parse::<u64>() {
            return Value::from(n);
        }
        if let Ok(n) = text.trim().parse::<i64>() {
            return Value::from(n);
        }
        if let Some(n) = text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
        {
            return Value::Number(n);
        }
    }
    Value::String(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fixtures;
    use serde_json::json;

    fn live_timing(count: u64) -> Vec<ChunkHeaders> {
        (0..count)
            .map(|i| ChunkHeaders {
                numchunks: Some(i.to_string()),
                time: Some((i * 1000).to_string()),
                state: Some("Live".to_string()),
                mtime1: Some(format!("m{i}")),
                mtime2: None,
            })
            .collect()
    }

    #[test]
    fn test_rewrite_uses_last_chunk() {
        let mut record = fixtures::record("abc", 1, true);
        let mut timing = live_timing(6);

        let confirmed = finalize_headers(&mut record, &mut timing).unwrap();
        assert_eq!(confirmed.chunks, 5);
        assert_eq!(confirmed.time.as_deref(), Some("5000"));

        for (i, entry) in timing.iter().enumerate() {
            assert_eq!(entry.numchunks.as_deref(), Some("5"));
            assert_eq!(entry.time.as_deref(), Some("5000"));
            assert_eq!(entry.state.as_deref(), Some("Recorded"));
            assert_eq!(entry.mtime1, Some(format!("m{i}")));
        }

        assert_eq!(record.meta.num_chunks, 5);
        assert!(!record.meta.live);
        assert!(!record.find.live);
        assert_eq!(record.start_downloading.num_chunks, 5);
        assert_eq!(record.start_downloading.state, ReplayState::Recorded);
        assert_eq!(record.start_downloading.time, json!(5000));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let mut record = fixtures::record("abc", 1, true);
        let mut timing = live_timing(4);

        let first = finalize_headers(&mut record, &mut timing).unwrap();
        let (record_once, timing_once) = (record.clone(), timing.clone());

        let second = finalize_headers(&mut record, &mut timing).unwrap();
        assert_eq!(first, second);
        assert_eq!(record, record_once);
        assert_eq!(timing, timing_once);
    }

    #[test]
    fn test_string_time_stays_string() {
        let mut record = fixtures::record("abc", 1, true);
        record.start_downloading.time = json!("100");
        let mut timing = live_timing(2);

        finalize_headers(&mut record, &mut timing).unwrap();
        assert_eq!(record.start_downloading.time, json!("1000"));
    }

    #[test]
    fn test_missing_time_falls_back_to_record() {
        let mut record = fixtures::record("abc", 1, true);
        let mut timing = vec![ChunkHeaders {
            numchunks: Some("1".to_string()),
            ..Default::default()
        }];

        let confirmed = finalize_headers(&mut record, &mut timing).unwrap();
        assert_eq!(confirmed.time.as_deref(), Some("30000"));
        assert_eq!(timing[0].time.as_deref(), Some("30000"));
    }

    #[test]
    fn test_inconsistent_capture() {
        let mut record = fixtures::record("abc", 1, true);
        assert!(matches!(
            finalize_headers(&mut record, &mut []),
            Err(TvError::InconsistentCapture(_))
        ));

        let mut timing = vec![ChunkHeaders::default()];
        assert!(matches!(
            finalize_headers(&mut record, &mut timing),
            Err(TvError::InconsistentCapture(_))
        ));

        let mut timing = vec![ChunkHeaders {
            numchunks: Some("many".to_string()),
            ..Default::default()
        }];
        assert!(matches!(
            finalize_headers(&mut record, &mut timing),
            Err(TvError::InconsistentCapture(_))
        ));
    }
}
