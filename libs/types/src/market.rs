//! Book primitives shared across the collector
//!
//! `Side` follows the exchange wire encoding: the sell side is spelled
//! "offer", not "ask". `PriceLevel` is one [price, quantity] row of a
//! book side.

use serde::{Deserialize, Serialize};

/// Side of the book a level2 update applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy side
    Bid,
    /// Sell side
    Offer,
}

impl Side {
    /// Wire string as sent by the exchange
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Offer => "offer",
        }
    }

    /// Parse the exchange wire string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bid" => Some(Side::Bid),
            "offer" => Some(Side::Offer),
            _ => None,
        }
    }
}

/// One price level of a book side.
///
/// A quantity of zero marks a deleted level on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

impl PriceLevel {
    /// Create a level from price and quantity.
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }

    /// Row form used by depth records.
    pub fn as_pair(&self) -> [f64; 2] {
        [self.price, self.quantity]
    }
}
