//! Market Data Collector
//!
//! Subscribes to an exchange's market data WebSocket and lands every feed
//! in QuestDB:
//! - Candles, trades, and ticker events, validated and normalized per table
//! - Level2 book deltas, plus a reconstructed depth snapshot per message
//! - Signed (ES256) subscribe/unsubscribe control messages
//! - An HTTP control plane for per-instrument subscription lifecycle
//!
//! # Architecture
//!
//! ```text
//!     HTTP control plane (axum)
//!         │ start / stop / status
//!  ┌──────▼────────┐
//!  │ Subscriptions │  one feed per instrument
//!  └──────┬────────┘
//!    ┌────┴──────────────┐
//!  ┌─▼──────────┐  ┌─────▼───────┐
//!  │ main conn  │  │ level2 conn │
//!  │ candles    │  │ book engine │
//!  │ trades     │  │ depth rows  │
//!  │ ticker     │  └─────┬───────┘
//!  └─┬──────────┘        │
//!    └────┬──────────────┘
//!    validate + normalize
//!  ┌──────▼────────┐
//!  │   Row sink    │  ILP appends, PG wire DDL
//!  └───────────────┘
//! ```

pub mod book;
pub mod config;
pub mod connector;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod router;
pub mod schema;
pub mod signing;
pub mod sink;
pub mod state;
pub mod tables;
pub mod transport;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
