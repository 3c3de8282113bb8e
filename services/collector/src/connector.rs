//! Exchange stream connector
//!
//! One [`FeedConnector`] owns one WebSocket's worth of channels for one
//! product:
//!
//! - subscribe/unsubscribe control messages, signed per message,
//! - channel dispatch into the table normalizers and the book engine,
//! - per-message error containment, so one bad payload never drops the feed,
//! - a reconnect loop that re-subscribes after transport loss.
//!
//! Flow: connect → subscribe → stream → (reconnect | cancel).

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use types::ids::ProductId;

use crate::book::OrderBook;
use crate::config::ApiKey;
use crate::error::FeedError;
use crate::signing;
use crate::sink::RowSink;
use crate::tables;
use crate::transport::{FeedConnection, FeedTransport, TransportError};

/// Channels carried by an instrument's main connection.
pub const MAIN_CHANNELS: &[Channel] = &[Channel::Candles, Channel::MarketTrades, Channel::Ticker];

/// The level2 connection carries only the book feed.
pub const L2_CHANNELS: &[Channel] = &[Channel::Level2];

/// The l2 connection tracks a deeper book than the engine default.
const L2_BOOK_LEVELS: usize = 2500;

/// Exchange channels, named as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Candles,
    Ticker,
    MarketTrades,
    Level2,
    Heartbeats,
    Subscriptions,
}

impl Channel {
    /// Wire name, used both to subscribe and to route inbound messages.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Channel::Candles => "candles",
            Channel::Ticker => "ticker",
            Channel::MarketTrades => "market_trades",
            Channel::Level2 => "l2_data",
            Channel::Heartbeats => "heartbeats",
            Channel::Subscriptions => "subscriptions",
        }
    }

    /// Parse a wire channel name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "candles" => Some(Channel::Candles),
            "ticker" => Some(Channel::Ticker),
            "market_trades" => Some(Channel::MarketTrades),
            "l2_data" => Some(Channel::Level2),
            "heartbeats" => Some(Channel::Heartbeats),
            "subscriptions" => Some(Channel::Subscriptions),
            _ => None,
        }
    }

    /// Heartbeats subscriptions are account wide, not per product.
    fn takes_product_ids(&self) -> bool {
        !matches!(self, Channel::Heartbeats)
    }
}

#[derive(Debug, Serialize)]
struct ControlRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    channel: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    product_ids: Option<[&'a str; 1]>,
    jwt: String,
}

/// Streams one product's channels over one connection.
pub struct FeedConnector {
    product_id: ProductId,
    channels: Vec<Channel>,
    api_key: ApiKey,
    sink: Arc<dyn RowSink>,
    book: Option<OrderBook>,
}

impl FeedConnector {
    pub fn new(
        product_id: ProductId,
        channels: Vec<Channel>,
        api_key: ApiKey,
        sink: Arc<dyn RowSink>,
    ) -> Self {
        let book = channels
            .contains(&Channel::Level2)
            .then(|| OrderBook::with_max_levels(product_id.clone(), L2_BOOK_LEVELS));
        Self {
            product_id,
            channels,
            api_key,
            sink,
            book,
        }
    }

    pub fn book(&self) -> Option<&OrderBook> {
        self.book.as_ref()
    }

    /// Drive the connection until cancelled or fatally broken.
    pub async fn run(
        mut self,
        transport: Arc<dyn FeedTransport>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        loop {
            if cancel.is_cancelled() {
                return Err(FeedError::Cancelled);
            }

            debug!(product_id = %self.product_id, "connecting");
            let mut conn = tokio::select! {
                _ = cancel.cancelled() => return Err(FeedError::Cancelled),
                attempt = transport.connect() => attempt.map_err(FeedError::Transport)?,
            };

            if let Err(err) = self.subscribe_all(conn.as_mut()).await {
                match err {
                    FeedError::Transport(err) => {
                        warn!(
                            product_id = %self.product_id,
                            error = %err,
                            "subscribe failed, reconnecting"
                        );
                        continue;
                    }
                    other => return Err(other),
                }
            }
            info!(
                product_id = %self.product_id,
                channels = ?self.channel_names(),
                "streaming"
            );

            match self.stream(conn.as_mut(), &cancel).await {
                Err(FeedError::Cancelled) => {
                    if let Err(err) = self.unsubscribe_all(conn.as_mut()).await {
                        debug!(
                            product_id = %self.product_id,
                            error = %err,
                            "unsubscribe on shutdown failed"
                        );
                    }
                    return Err(FeedError::Cancelled);
                }
                Err(FeedError::Transport(err)) => {
                    warn!(
                        product_id = %self.product_id,
                        error = %err,
                        "connection lost, reconnecting"
                    );
                }
                Err(other) => return Err(other),
                Ok(()) => {}
            }
        }
    }

    async fn stream(
        &mut self,
        conn: &mut dyn FeedConnection,
        cancel: &CancellationToken,
    ) -> Result<(), FeedError> {
        loop {
            let text = tokio::select! {
                _ = cancel.cancelled() => return Err(FeedError::Cancelled),
                inbound = conn.next_message() => match inbound {
                    Some(Ok(text)) => text,
                    Some(Err(err)) => return Err(FeedError::Transport(err)),
                    None => return Err(FeedError::Transport(TransportError::Closed)),
                },
            };

            if let Err(err) = self.dispatch(&text).await {
                if err.is_contained() {
                    // Sink trouble is worth telling apart from bad wire data.
                    match &err {
                        FeedError::Ingestion(_) => warn!(
                            product_id = %self.product_id,
                            error = %err,
                            "sink write failed, message dropped"
                        ),
                        FeedError::Schema(_) => warn!(
                            product_id = %self.product_id,
                            error = %err,
                            "message failed validation, dropped"
                        ),
                        _ => warn!(
                            product_id = %self.product_id,
                            error = %err,
                            "malformed message dropped"
                        ),
                    }
                    continue;
                }
                return Err(err);
            }
        }
    }

    /// Route one inbound message by its channel marker.
    ///
    /// Channels without a handler, including unknown ones, are ignored.
    async fn dispatch(&mut self, text: &str) -> Result<(), FeedError> {
        let message: Json = serde_json::from_str(text)
            .map_err(|err| FeedError::Malformed(format!("unparseable message: {err}")))?;

        let channel = message.get("channel").and_then(Json::as_str);
        match channel.and_then(Channel::parse) {
            Some(Channel::Candles) => tables::candles::handle(&message, self.sink.as_ref()).await,
            Some(Channel::MarketTrades) => {
                tables::trades::handle(&message, self.sink.as_ref()).await
            }
            Some(Channel::Ticker) => tables::ticker::handle(&message, self.sink.as_ref()).await,
            Some(Channel::Level2) => self.consume_level2(&message).await,
            Some(Channel::Heartbeats) | Some(Channel::Subscriptions) | None => {
                trace!(
                    channel = channel.unwrap_or("<missing>"),
                    "unhandled channel ignored"
                );
                Ok(())
            }
        }
    }

    /// Feed the book first; its depth write must precede the raw rows.
    async fn consume_level2(&mut self, message: &Json) -> Result<(), FeedError> {
        if let Some(book) = self.book.as_mut() {
            book.consume(message, self.sink.as_ref()).await?;
        }
        tables::level2::handle(message, self.sink.as_ref()).await
    }

    async fn subscribe_all(&self, conn: &mut dyn FeedConnection) -> Result<(), FeedError> {
        for channel in &self.channels {
            let request = self.control_message("subscribe", *channel)?;
            conn.send(&request).await.map_err(FeedError::Transport)?;
            debug!(
                product_id = %self.product_id,
                channel = channel.wire_name(),
                "subscribed"
            );
        }
        Ok(())
    }

    async fn unsubscribe_all(&self, conn: &mut dyn FeedConnection) -> Result<(), FeedError> {
        for channel in &self.channels {
            let request = self.control_message("unsubscribe", *channel)?;
            conn.send(&request).await.map_err(FeedError::Transport)?;
        }
        Ok(())
    }

    fn control_message(&self, kind: &str, channel: Channel) -> Result<String, FeedError> {
        let jwt = signing::session_token(&self.api_key)?;
        let request = ControlRequest {
            kind,
            channel: channel.wire_name(),
            product_ids: channel
                .takes_product_ids()
                .then(|| [self.product_id.as_str()]),
            jwt,
        };
        serde_json::to_string(&request)
            .map_err(|err| FeedError::Malformed(format!("control request encoding: {err}")))
    }

    fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.wire_name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::testkey::test_api_key;
    use crate::sink::RecordingSink;
    use serde_json::json;

    fn make_connector(channels: &[Channel]) -> (FeedConnector, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let connector = FeedConnector::new(
            ProductId::from("BTC-USD"),
            channels.to_vec(),
            test_api_key(),
            sink.clone(),
        );
        (connector, sink)
    }

    #[test]
    fn test_channel_wire_names_round_trip() {
        for channel in [
            Channel::Candles,
            Channel::Ticker,
            Channel::MarketTrades,
            Channel::Level2,
            Channel::Heartbeats,
            Channel::Subscriptions,
        ] {
            assert_eq!(Channel::parse(channel.wire_name()), Some(channel));
        }
        assert_eq!(Channel::Level2.wire_name(), "l2_data");
        assert!(Channel::parse("level2").is_none());
    }

    #[test]
    fn test_control_message_shape() {
        let (connector, _) = make_connector(MAIN_CHANNELS);
        let raw = connector
            .control_message("subscribe", Channel::Ticker)
            .unwrap();

        assert!(raw.starts_with(
            "{\"type\":\"subscribe\",\"channel\":\"ticker\",\"product_ids\":[\"BTC-USD\"],\"jwt\":\""
        ));

        let parsed: Json = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["type"], "subscribe");
        assert_eq!(parsed["channel"], "ticker");
        assert_eq!(parsed["product_ids"], json!(["BTC-USD"]));
        assert!(parsed["jwt"].as_str().unwrap().split('.').count() == 3);
    }

    #[test]
    fn test_heartbeats_subscribe_has_no_product_ids() {
        let (connector, _) = make_connector(&[Channel::Heartbeats]);
        let raw = connector
            .control_message("subscribe", Channel::Heartbeats)
            .unwrap();
        let parsed: Json = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["channel"], "heartbeats");
        assert!(parsed.get("product_ids").is_none());
    }

    #[test]
    fn test_level2_connection_owns_a_deeper_book() {
        let (connector, _) = make_connector(L2_CHANNELS);
        let book = connector.book().unwrap();
        assert_eq!(book.bids().capacity(), L2_BOOK_LEVELS);

        let (connector, _) = make_connector(MAIN_CHANNELS);
        assert!(connector.book().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_routes_ticker() {
        let (mut connector, sink) = make_connector(MAIN_CHANNELS);
        let message = json!({
            "channel": "ticker",
            "timestamp": "1970-01-01T00:00:05Z",
            "sequence_num": 0,
            "events": [{
                "type": "update",
                "tickers": [{"type": "ticker", "product_id": "BTC-USD", "price": "100.5"}]
            }]
        });

        connector.dispatch(&message.to_string()).await.unwrap();
        assert_eq!(sink.rows_for("ticker").len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_level2_feeds_book_then_table() {
        let (mut connector, sink) = make_connector(L2_CHANNELS);
        let message = json!({
            "channel": "l2_data",
            "timestamp": "1970-01-01T00:00:01Z",
            "sequence_num": 1,
            "events": [{
                "type": "snapshot",
                "product_id": "BTC-USD",
                "updates": [
                    {"side": "bid", "event_time": "1970-01-01T00:00:01Z", "price_level": "100", "new_quantity": "1"},
                    {"side": "offer", "event_time": "1970-01-01T00:00:01Z", "price_level": "101", "new_quantity": "2"}
                ]
            }]
        });

        connector.dispatch(&message.to_string()).await.unwrap();

        assert_eq!(sink.rows_for("order_book").len(), 1);
        assert_eq!(sink.rows_for("level2").len(), 2);
        let book = connector.book().unwrap();
        assert_eq!(book.bids().len(), 1);
        assert_eq!(book.asks().len(), 1);
        assert_eq!(book.last_sequence_num(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_ignores_unregistered_channels() {
        let (mut connector, sink) = make_connector(MAIN_CHANNELS);

        connector
            .dispatch(&json!({"channel": "heartbeats"}).to_string())
            .await
            .unwrap();
        connector
            .dispatch(&json!({"channel": "brand_new_channel"}).to_string())
            .await
            .unwrap();
        connector
            .dispatch(&json!({"no_channel_at_all": true}).to_string())
            .await
            .unwrap();

        assert_eq!(sink.row_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_flags_unparseable_frames() {
        let (mut connector, _) = make_connector(MAIN_CHANNELS);
        let err = connector.dispatch("{truncated").await.unwrap_err();
        assert!(matches!(err, FeedError::Malformed(_)));
        assert!(err.is_contained());
    }

    #[tokio::test]
    async fn test_dispatch_contains_sink_failures() {
        let (mut connector, sink) = make_connector(MAIN_CHANNELS);
        sink.fail_writes(true);
        let message = json!({
            "channel": "ticker",
            "timestamp": "1970-01-01T00:00:05Z",
            "sequence_num": 0,
            "events": [{
                "type": "update",
                "tickers": [{"type": "ticker", "product_id": "BTC-USD", "price": "100.5"}]
            }]
        });

        let err = connector.dispatch(&message.to_string()).await.unwrap_err();
        assert!(matches!(err, FeedError::Ingestion(_)));
        assert!(err.is_contained());
    }
}
