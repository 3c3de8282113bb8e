//! Types library for the market data collector
//!
//! Shared type definitions used across the collector: instrument
//! identifiers, book primitives, and wire timestamp handling.
//!
//! # Modules
//! - `ids`: Instrument identifiers (ProductId)
//! - `market`: Book primitives (Side, PriceLevel)
//! - `time`: Wire timestamp parsing (Unix nanoseconds)

// Public modules
pub mod ids;
pub mod market;
pub mod time;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::market::*;
    pub use crate::time::*;
}
