//! `ticker` table
//!
//! Ticker snapshots and updates carry the same shape, so every event
//! inserts rows; there is no batch path. The redundant `type` marker
//! inside each ticker entry is dropped before validation.

use std::sync::LazyLock;

use serde_json::{json, Value as Json};

use super::{entry_to_raw, event_entries, message_parts};
use crate::error::FeedError;
use crate::schema::{ColumnSpec, ColumnType, RawRecord, TableSchema};
use crate::sink::RowSink;

const DDL: &str = "\
CREATE TABLE IF NOT EXISTS ticker (
    timestamp TIMESTAMP,
    product_id SYMBOL,
    price DOUBLE,
    volume_24_h DOUBLE,
    low_24_h DOUBLE,
    high_24_h DOUBLE,
    low_52_w DOUBLE,
    high_52_w DOUBLE,
    price_percent_chg_24_h DOUBLE,
    best_bid DOUBLE,
    best_ask DOUBLE,
    best_bid_quantity DOUBLE,
    best_ask_quantity DOUBLE
) TIMESTAMP (timestamp)
PARTITION BY DAY
DEDUP UPSERT KEYS(timestamp, product_id)";

static SCHEMA: LazyLock<TableSchema> = LazyLock::new(|| {
    TableSchema::new(
        "ticker",
        DDL,
        vec![
            ColumnSpec::optional("price", ColumnType::Double),
            ColumnSpec::optional("volume_24_h", ColumnType::Double),
            ColumnSpec::optional("low_24_h", ColumnType::Double),
            ColumnSpec::optional("high_24_h", ColumnType::Double),
            ColumnSpec::optional("low_52_w", ColumnType::Double),
            ColumnSpec::optional("high_52_w", ColumnType::Double),
            ColumnSpec::optional("price_percent_chg_24_h", ColumnType::Double),
            ColumnSpec::optional("best_bid", ColumnType::Double),
            ColumnSpec::optional("best_ask", ColumnType::Double),
            ColumnSpec::optional("best_bid_quantity", ColumnType::Double),
            ColumnSpec::optional("best_ask_quantity", ColumnType::Double),
        ],
    )
});

pub fn schema() -> &'static TableSchema {
    &SCHEMA
}

fn ticker_row(timestamp: i64, entry: &Json) -> Result<RawRecord, FeedError> {
    let mut raw = entry_to_raw(entry)?;
    raw.remove("type");
    raw.insert("timestamp".into(), json!(timestamp));
    Ok(raw)
}

/// Insert every ticker in every event as its own row.
pub async fn handle(message: &Json, sink: &dyn RowSink) -> Result<(), FeedError> {
    let (timestamp, events) = message_parts(message)?;
    for event in events {
        for entry in event_entries(event, "tickers")? {
            let record = schema().validate_record(&ticker_row(timestamp, entry)?)?;
            sink.insert_row(schema(), &record).await?;
        }
    }
    Ok(())
}
