//! `order_book` table
//!
//! Full reconstructed depth, one row per consumed book message: the
//! occupied bid and ask prefixes as `[price, quantity]` matrices.

use std::sync::LazyLock;

use serde_json::{json, Value as Json};
use types::ids::ProductId;
use types::market::PriceLevel;

use crate::error::FeedError;
use crate::schema::{ColumnSpec, ColumnType, RawRecord, TableSchema};
use crate::sink::RowSink;

const DDL: &str = "\
CREATE TABLE IF NOT EXISTS order_book (
    timestamp TIMESTAMP,
    product_id SYMBOL,
    bids DOUBLE[][],
    asks DOUBLE[][]
) TIMESTAMP (timestamp)
PARTITION BY DAY
DEDUP UPSERT KEYS(timestamp, product_id)";

static SCHEMA: LazyLock<TableSchema> = LazyLock::new(|| {
    TableSchema::new(
        "order_book",
        DDL,
        vec![
            ColumnSpec::required("bids", ColumnType::DoubleMatrix),
            ColumnSpec::required("asks", ColumnType::DoubleMatrix),
        ],
    )
});

pub fn schema() -> &'static TableSchema {
    &SCHEMA
}

/// Write one depth snapshot row.
pub async fn write(
    sink: &dyn RowSink,
    timestamp: i64,
    product_id: &ProductId,
    bids: &[PriceLevel],
    asks: &[PriceLevel],
) -> Result<(), FeedError> {
    let mut raw = RawRecord::new();
    raw.insert("timestamp".into(), json!(timestamp));
    raw.insert("product_id".into(), json!(product_id.as_str()));
    raw.insert("bids".into(), levels_json(bids));
    raw.insert("asks".into(), levels_json(asks));

    let record = schema().validate_record(&raw)?;
    sink.insert_row(schema(), &record).await?;
    Ok(())
}

fn levels_json(levels: &[PriceLevel]) -> Json {
    Json::Array(levels.iter().map(|level| json!(level.as_pair())).collect())
}
