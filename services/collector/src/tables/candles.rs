//! `candles` table
//!
//! OHLCV bars from the `candles` channel. The wire sends `start` as epoch
//! seconds; it is widened to Unix nanos here so every timestamp in the
//! pipeline shares one unit.

use std::sync::LazyLock;

use serde_json::{json, Value as Json};

use super::{entry_to_raw, event_entries, event_type, message_parts};
use crate::error::FeedError;
use crate::schema::{json_to_i64, ColumnSpec, ColumnType, RawRecord, TableSchema};
use crate::sink::RowSink;

const DDL: &str = "\
CREATE TABLE IF NOT EXISTS candles (
    timestamp TIMESTAMP,
    start TIMESTAMP,
    low DOUBLE,
    high DOUBLE,
    open DOUBLE,
    close DOUBLE,
    volume DOUBLE,
    product_id SYMBOL
) TIMESTAMP (timestamp)
PARTITION BY DAY
DEDUP UPSERT KEYS(timestamp, start, product_id);";

static SCHEMA: LazyLock<TableSchema> = LazyLock::new(|| {
    TableSchema::new(
        "candles",
        DDL,
        vec![
            ColumnSpec::optional("start", ColumnType::Timestamp),
            ColumnSpec::optional("low", ColumnType::Double),
            ColumnSpec::optional("high", ColumnType::Double),
            ColumnSpec::optional("open", ColumnType::Double),
            ColumnSpec::optional("close", ColumnType::Double),
            ColumnSpec::optional("volume", ColumnType::Double),
        ],
    )
});

pub fn schema() -> &'static TableSchema {
    &SCHEMA
}

fn candle_row(timestamp: i64, entry: &Json) -> Result<RawRecord, FeedError> {
    let mut raw = entry_to_raw(entry)?;
    raw.insert("timestamp".into(), json!(timestamp));
    if let Some(start) = raw.get("start") {
        let nanos = json_to_i64(start)
            .and_then(|secs| secs.checked_mul(1_000_000_000))
            .ok_or_else(|| FeedError::Malformed(format!("bad candle start: {start}")))?;
        raw.insert("start".into(), json!(nanos));
    }
    Ok(raw)
}

/// Route one candles message: snapshots as batches, updates as rows.
pub async fn handle(message: &Json, sink: &dyn RowSink) -> Result<(), FeedError> {
    let (timestamp, events) = message_parts(message)?;
    for event in events {
        match event_type(event)? {
            "snapshot" => {
                let rows = event_entries(event, "candles")?
                    .iter()
                    .map(|entry| candle_row(timestamp, entry))
                    .collect::<Result<Vec<_>, _>>()?;
                let records = schema().validate_batch(&rows)?;
                sink.ingest_batch(schema(), &records).await?;
            }
            "update" => {
                for entry in event_entries(event, "candles")? {
                    let record = schema().validate_record(&candle_row(timestamp, entry)?)?;
                    sink.insert_row(schema(), &record).await?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}
