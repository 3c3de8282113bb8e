//! `level2` table
//!
//! Raw depth deltas from the `l2_data` channel, one row per price level
//! update. Snapshots and updates carry the same shape, so every event is
//! ingested as a batch. `event_time` is the designated timestamp; the
//! message timestamp is kept as an ordinary column.

use std::sync::LazyLock;

use serde_json::{json, Value as Json};

use super::{entry_to_raw, event_entries, message_parts};
use crate::error::FeedError;
use crate::schema::{ColumnSpec, ColumnType, RawRecord, TableSchema};
use crate::sink::RowSink;

const DDL: &str = "\
CREATE TABLE IF NOT EXISTS level2 (
    timestamp TIMESTAMP,
    product_id SYMBOL,
    side SYMBOL CAPACITY 2,
    event_time TIMESTAMP,
    price_level DOUBLE,
    new_quantity DOUBLE
) TIMESTAMP (event_time)
PARTITION BY DAY
DEDUP UPSERT KEYS(product_id, event_time, price_level)";

static SCHEMA: LazyLock<TableSchema> = LazyLock::new(|| {
    TableSchema::new(
        "level2",
        DDL,
        vec![
            ColumnSpec::required("side", ColumnType::Symbol),
            ColumnSpec::required("event_time", ColumnType::Timestamp),
            ColumnSpec::required("price_level", ColumnType::Double),
            ColumnSpec::required("new_quantity", ColumnType::Double),
        ],
    )
    .with_symbols(&["side"])
    .with_time_column("event_time")
});

pub fn schema() -> &'static TableSchema {
    &SCHEMA
}

fn update_rows(timestamp: i64, event: &Json) -> Result<Vec<RawRecord>, FeedError> {
    let product_id = event
        .get("product_id")
        .and_then(Json::as_str)
        .ok_or_else(|| FeedError::Malformed("event missing product_id".into()))?;

    let mut rows = Vec::new();
    for entry in event_entries(event, "updates")? {
        let mut raw = entry_to_raw(entry)?;
        raw.insert("timestamp".into(), json!(timestamp));
        raw.insert("product_id".into(), json!(product_id));
        rows.push(raw);
    }
    Ok(rows)
}

/// Ingest every event's updates as one batch.
pub async fn handle(message: &Json, sink: &dyn RowSink) -> Result<(), FeedError> {
    let (timestamp, events) = message_parts(message)?;
    for event in events {
        let rows = update_rows(timestamp, event)?;
        let records = schema().validate_batch(&rows)?;
        sink.ingest_batch(schema(), &records).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaError, Value};
    use crate::sink::RecordingSink;

    fn make_message() -> Json {
        json!({
            "channel": "l2_data",
            "timestamp": "1970-01-01T00:00:10Z",
            "sequence_num": 0,
            "events": [
                {
                    "type": "update",
                    "product_id": "BTC-USD",
                    "updates": [
                        {
                            "side": "bid",
                            "event_time": "1970-01-01T00:00:09Z",
                            "price_level": "21600.73",
                            "new_quantity": "0.06317902"
                        },
                        {
                            "side": "offer",
                            "event_time": "1970-01-01T00:00:09.5Z",
                            "price_level": "21646.16",
                            "new_quantity": "0.02"
                        }
                    ]
                }
            ]
        })
    }

    #[tokio::test]
    async fn test_batch_carries_event_and_message_times() {
        let sink = RecordingSink::new();
        handle(&make_message(), &sink).await.unwrap();

        let rows = sink.rows_for("level2");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("timestamp"), Some(&Value::Timestamp(10_000_000_000)));
        assert_eq!(rows[0].get("event_time"), Some(&Value::Timestamp(9_000_000_000)));
        assert_eq!(rows[0].get("product_id"), Some(&Value::Str("BTC-USD".into())));
        assert_eq!(rows[1].get("side"), Some(&Value::Str("offer".into())));
        assert_eq!(rows[1].get("price_level"), Some(&Value::Double(21646.16)));
    }

    #[tokio::test]
    async fn test_snapshot_shape_is_treated_the_same() {
        let mut message = make_message();
        message["events"][0]["type"] = json!("snapshot");
        let sink = RecordingSink::new();
        handle(&message, &sink).await.unwrap();
        assert_eq!(sink.rows_for("level2").len(), 2);
    }

    #[tokio::test]
    async fn test_missing_product_id_is_malformed() {
        let mut message = make_message();
        message["events"][0].as_object_mut().unwrap().remove("product_id");
        let sink = RecordingSink::new();
        let err = handle(&message, &sink).await.unwrap_err();
        assert!(matches!(err, FeedError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_batch_violation_names_the_column() {
        let mut message = make_message();
        message["events"][0]["updates"][1]["new_quantity"] = json!("plenty");
        let sink = RecordingSink::new();
        let err = handle(&message, &sink).await.unwrap_err();
        match err {
            FeedError::Schema(SchemaError::BatchViolation { column, .. }) => {
                assert_eq!(column, "new_quantity");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(sink.row_count(), 0);
    }

    #[test]
    fn test_event_time_is_designated() {
        assert_eq!(schema().time_column(), "event_time");
        assert!(schema().symbol_columns().contains(&"side"));
    }
}
