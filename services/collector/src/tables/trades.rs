//! `market_trades` table
//!
//! Executed trades keep their own execution time: the wire `time` field is
//! renamed to `timestamp` and the message timestamp is not used.

use std::sync::LazyLock;

use serde_json::Value as Json;

use super::{entry_to_raw, event_entries, event_type, message_parts};
use crate::error::FeedError;
use crate::schema::{ColumnSpec, ColumnType, RawRecord, TableSchema};
use crate::sink::RowSink;

const DDL: &str = "\
CREATE TABLE IF NOT EXISTS market_trades (
    timestamp TIMESTAMP,
    product_id SYMBOL,
    trade_id LONG,
    price DOUBLE,
    size DOUBLE,
    side SYMBOL CAPACITY 2
) TIMESTAMP (timestamp)
PARTITION BY DAY
DEDUP UPSERT KEYS(timestamp, trade_id)";

static SCHEMA: LazyLock<TableSchema> = LazyLock::new(|| {
    TableSchema::new(
        "market_trades",
        DDL,
        vec![
            ColumnSpec::optional("trade_id", ColumnType::Long),
            ColumnSpec::optional("price", ColumnType::Double),
            ColumnSpec::optional("size", ColumnType::Double),
            ColumnSpec::optional("side", ColumnType::Symbol),
        ],
    )
    .with_symbols(&["side"])
});

pub fn schema() -> &'static TableSchema {
    &SCHEMA
}

fn trade_row(entry: &Json) -> Result<RawRecord, FeedError> {
    let mut raw = entry_to_raw(entry)?;
    let time = raw
        .remove("time")
        .ok_or_else(|| FeedError::Malformed("trade missing time".into()))?;
    raw.insert("timestamp".into(), time);
    Ok(raw)
}

/// Route one market trades message: snapshots as batches, updates as rows.
pub async fn handle(message: &Json, sink: &dyn RowSink) -> Result<(), FeedError> {
    let (_, events) = message_parts(message)?;
    for event in events {
        match event_type(event)? {
            "snapshot" => {
                let rows = event_entries(event, "trades")?
                    .iter()
                    .map(trade_row)
                    .collect::<Result<Vec<_>, _>>()?;
                let records = schema().validate_batch(&rows)?;
                sink.ingest_batch(schema(), &records).await?;
            }
            "update" => {
                for entry in event_entries(event, "trades")? {
                    let record = schema().validate_record(&trade_row(entry)?)?;
                    sink.insert_row(schema(), &record).await?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Value;
    use crate::sink::RecordingSink;
    use serde_json::json;

    fn make_message(event_type: &str) -> Json {
        json!({
            "channel": "market_trades",
            "timestamp": "2023-06-09T20:19:35.39625135Z",
            "sequence_num": 0,
            "events": [
                {
                    "type": event_type,
                    "trades": [
                        {
                            "trade_id": "000000000",
                            "product_id": "ETH-USD",
                            "price": "1826.72",
                            "size": "0.002",
                            "side": "BUY",
                            "time": "1970-01-01T00:00:02Z"
                        }
                    ]
                }
            ]
        })
    }

    #[tokio::test]
    async fn test_time_becomes_the_row_timestamp() {
        let sink = RecordingSink::new();
        handle(&make_message("snapshot"), &sink).await.unwrap();

        let rows = sink.rows_for("market_trades");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("timestamp"), Some(&Value::Timestamp(2_000_000_000)));
        assert_eq!(rows[0].get("time"), None);
        assert_eq!(rows[0].get("trade_id"), Some(&Value::Long(0)));
        assert_eq!(rows[0].get("side"), Some(&Value::Str("BUY".into())));
    }

    #[tokio::test]
    async fn test_update_inserts_rows() {
        let sink = RecordingSink::new();
        handle(&make_message("update"), &sink).await.unwrap();
        assert_eq!(sink.rows_for("market_trades").len(), 1);
    }

    #[tokio::test]
    async fn test_trade_without_time_is_malformed() {
        let mut message = make_message("update");
        message["events"][0]["trades"][0]
            .as_object_mut()
            .unwrap()
            .remove("time");
        let sink = RecordingSink::new();
        let err = handle(&message, &sink).await.unwrap_err();
        assert!(matches!(err, FeedError::Malformed(_)));
    }

    #[test]
    fn test_side_rides_as_symbol() {
        assert!(schema().symbol_columns().contains(&"side"));
        assert!(schema().symbol_columns().contains(&"product_id"));
    }
}
