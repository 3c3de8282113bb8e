//! Order book reconstruction
//!
//! One [`OrderBook`] per product per l2 connection. Each side keeps its
//! levels in a fixed-capacity array with an occupied prefix:
//!
//! - bids sorted by price descending, asks ascending, prices unique,
//! - slots past the prefix stay zeroed,
//! - capacity grows geometrically and never shrinks.
//!
//! Messages whose sequence number is smaller than the last applied one
//! are dropped before parsing; an equal sequence number is re-applied.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde_json::Value as Json;
use tracing::debug;
use types::ids::ProductId;
use types::market::{PriceLevel, Side};
use types::time::parse_rfc3339_nanos;

use crate::error::FeedError;
use crate::schema::json_to_f64;
use crate::sink::RowSink;
use crate::tables::{self, depth};

/// Starting capacity for each side.
pub const DEFAULT_MAX_LEVELS: usize = 1000;

/// Round up to the highest digit: 4207 -> 5000, 2100 -> 3000, 2001 -> 3000.
fn round_up(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let mut magnitude = 1;
    while n / magnitude >= 10 {
        magnitude *= 10;
    }
    n.div_ceil(magnitude) * magnitude
}

/// One side of the book: a capacity array with an occupied prefix.
#[derive(Debug, Clone)]
pub struct BookSide {
    levels: Vec<PriceLevel>,
    len: usize,
}

impl BookSide {
    fn with_capacity(max_levels: usize) -> Self {
        Self {
            levels: vec![PriceLevel::default(); max_levels],
            len: 0,
        }
    }

    /// Occupied levels, best price first.
    pub fn occupied(&self) -> &[PriceLevel] {
        &self.levels[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated slots, occupied or not.
    pub fn capacity(&self) -> usize {
        self.levels.len()
    }

    fn ensure_capacity(&mut self, n_levels: usize) {
        let capacity = self.levels.len();
        if n_levels < capacity {
            return;
        }
        let new_capacity = (capacity * 2).max(round_up(n_levels));
        debug!(
            from = capacity,
            to = new_capacity,
            "order book capacity expanded"
        );
        self.levels.resize(new_capacity, PriceLevel::default());
    }

    /// Replace the occupied prefix, zeroing vacated slots.
    fn store(&mut self, levels: Vec<PriceLevel>) {
        self.ensure_capacity(levels.len());
        let old_len = self.len;
        self.len = levels.len();
        self.levels[..self.len].copy_from_slice(&levels);
        if old_len > self.len {
            self.levels[self.len..old_len].fill(PriceLevel::default());
        }
    }
}

/// Per-side deltas grouped out of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDeltas {
    /// Message timestamp, Unix nanos.
    pub timestamp: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

struct Delta {
    level: PriceLevel,
    event_time: i64,
}

/// Group a message's updates into per-side deltas.
///
/// Duplicate prices within one message collapse to the update with the
/// latest `event_time`; on equal times the first occurrence wins.
pub fn parse_deltas(message: &Json) -> Result<ParsedDeltas, FeedError> {
    let (timestamp, events) = tables::message_parts(message)?;

    let mut bids: BTreeMap<u64, Delta> = BTreeMap::new();
    let mut asks: BTreeMap<u64, Delta> = BTreeMap::new();
    for event in events {
        for update in tables::event_entries(event, "updates")? {
            let side = field_str(update, "side").and_then(|s| {
                Side::parse(s).ok_or_else(|| FeedError::Malformed(format!("unknown side: {s}")))
            })?;
            let event_time = parse_rfc3339_nanos(field_str(update, "event_time")?)
                .map_err(|err| FeedError::Malformed(format!("bad event_time: {err}")))?;
            let price = field_f64(update, "price_level")?;
            let quantity = field_f64(update, "new_quantity")?;

            let grouped = match side {
                Side::Bid => &mut bids,
                Side::Offer => &mut asks,
            };
            let delta = Delta {
                level: PriceLevel::new(price, quantity),
                event_time,
            };
            match grouped.entry(price.to_bits()) {
                Entry::Vacant(slot) => {
                    slot.insert(delta);
                }
                Entry::Occupied(mut slot) => {
                    if event_time > slot.get().event_time {
                        slot.insert(delta);
                    }
                }
            }
        }
    }

    Ok(ParsedDeltas {
        timestamp,
        bids: bids.into_values().map(|d| d.level).collect(),
        asks: asks.into_values().map(|d| d.level).collect(),
    })
}

fn field_str<'a>(update: &'a Json, key: &str) -> Result<&'a str, FeedError> {
    update
        .get(key)
        .and_then(Json::as_str)
        .ok_or_else(|| FeedError::Malformed(format!("update missing {key}")))
}

fn field_f64(update: &Json, key: &str) -> Result<f64, FeedError> {
    update
        .get(key)
        .and_then(json_to_f64)
        .ok_or_else(|| FeedError::Malformed(format!("update missing {key}")))
}

fn apply_to_side(side: &mut BookSide, deltas: &[PriceLevel], descending: bool) {
    let mut levels: BTreeMap<u64, PriceLevel> = side
        .occupied()
        .iter()
        .map(|level| (level.price.to_bits(), *level))
        .collect();

    for delta in deltas {
        if delta.quantity > 0.0 {
            levels.insert(delta.price.to_bits(), *delta);
        } else {
            levels.remove(&delta.price.to_bits());
        }
    }

    let mut current: Vec<PriceLevel> = levels.into_values().collect();
    if descending {
        current.sort_by(|a, b| b.price.total_cmp(&a.price));
    } else {
        current.sort_by(|a, b| a.price.total_cmp(&b.price));
    }

    side.store(current);
}

/// Reconstructed book for one product.
#[derive(Debug)]
pub struct OrderBook {
    product_id: ProductId,
    bids: BookSide,
    asks: BookSide,
    last_sequence_num: i64,
}

impl OrderBook {
    pub fn new(product_id: ProductId) -> Self {
        Self::with_max_levels(product_id, DEFAULT_MAX_LEVELS)
    }

    pub fn with_max_levels(product_id: ProductId, max_levels: usize) -> Self {
        Self {
            product_id,
            bids: BookSide::with_capacity(max_levels),
            asks: BookSide::with_capacity(max_levels),
            last_sequence_num: -1,
        }
    }

    pub fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    pub fn bids(&self) -> &BookSide {
        &self.bids
    }

    pub fn asks(&self) -> &BookSide {
        &self.asks
    }

    pub fn last_sequence_num(&self) -> i64 {
        self.last_sequence_num
    }

    /// Apply parsed deltas: upserts for positive quantities, deletes for the rest.
    ///
    /// Deleting an absent price is a no-op; the last delta for a price wins.
    pub fn apply_deltas(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        apply_to_side(&mut self.bids, bids, true);
        apply_to_side(&mut self.asks, asks, false);
    }

    /// Apply one l2 message and write the resulting depth row.
    pub async fn consume(&mut self, message: &Json, sink: &dyn RowSink) -> Result<(), FeedError> {
        let sequence_num = message
            .get("sequence_num")
            .and_then(Json::as_i64)
            .ok_or_else(|| FeedError::Malformed("message missing sequence_num".into()))?;
        if sequence_num < self.last_sequence_num {
            debug!(
                product_id = %self.product_id,
                sequence_num,
                last_sequence_num = self.last_sequence_num,
                "out-of-order message dropped"
            );
            return Ok(());
        }
        self.last_sequence_num = sequence_num;

        let deltas = parse_deltas(message)?;
        self.apply_deltas(&deltas.bids, &deltas.asks);

        depth::write(
            sink,
            deltas.timestamp,
            &self.product_id,
            self.bids.occupied(),
            self.asks.occupied(),
        )
        .await
    }
}
