//! Table descriptors and channel normalizers
//!
//! One module per QuestDB table the collector writes. Each owns its DDL,
//! a static [`TableSchema`], and the normalizers that turn raw channel
//! events into records for the sink. The shared routing convention comes
//! from the exchange message envelope:
//!
//! ```text
//! { "channel": ..., "timestamp": ..., "sequence_num": ..., "events": [ ... ] }
//! ```
//!
//! Snapshot events become batches and update events become rows, except
//! where a channel makes the two indistinguishable (`ticker`, `l2_data`).

pub mod candles;
pub mod depth;
pub mod level2;
pub mod ticker;
pub mod trades;

use serde_json::Value as Json;
use types::time::parse_rfc3339_nanos;

use crate::error::FeedError;
use crate::schema::{RawRecord, TableSchema};

/// Schemas of every table the collector writes, for startup DDL.
pub fn all_schemas() -> [&'static TableSchema; 5] {
    [
        candles::schema(),
        trades::schema(),
        ticker::schema(),
        level2::schema(),
        depth::schema(),
    ]
}

/// Split a feed message into its timestamp (Unix nanos) and events array.
pub(crate) fn message_parts(message: &Json) -> Result<(i64, &[Json]), FeedError> {
    let raw_ts = message
        .get("timestamp")
        .and_then(Json::as_str)
        .ok_or_else(|| FeedError::Malformed("message missing timestamp".into()))?;
    let timestamp = parse_rfc3339_nanos(raw_ts)
        .map_err(|err| FeedError::Malformed(format!("bad message timestamp: {err}")))?;
    let events = message
        .get("events")
        .and_then(Json::as_array)
        .ok_or_else(|| FeedError::Malformed("message missing events".into()))?;
    Ok((timestamp, events.as_slice()))
}

/// Array field of an event, e.g. `candles` or `trades`.
pub(crate) fn event_entries<'a>(event: &'a Json, key: &str) -> Result<&'a [Json], FeedError> {
    event
        .get(key)
        .and_then(Json::as_array)
        .map(|entries| entries.as_slice())
        .ok_or_else(|| FeedError::Malformed(format!("event missing {key}")))
}

/// Copy an event entry's fields into a raw record.
pub(crate) fn entry_to_raw(entry: &Json) -> Result<RawRecord, FeedError> {
    let object = entry
        .as_object()
        .ok_or_else(|| FeedError::Malformed("event entry is not an object".into()))?;
    Ok(object.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// Event type marker: `snapshot` or `update`.
pub(crate) fn event_type(event: &Json) -> Result<&str, FeedError> {
    event
        .get("type")
        .and_then(Json::as_str)
        .ok_or_else(|| FeedError::Malformed("event missing type".into()))
}
