//! Streaming client for candle events.
//!
//! Maintains the persistent websocket connection to the upstream feed:
//! - Authentication + candle subscription handshake on connect
//! - FEED_DATA envelope decoding into typed candle records
//! - Auto-reconnection with exponential backoff
//! - Cooperative shutdown
//!
//! Malformed records are dropped and logged; only an explicit shutdown
//! terminates the loop.

use crate::errors::{FeederError, Result};
use crate::session::SessionManager;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Maximum exponential backoff delay between reconnect attempts, in seconds.
const MAX_BACKOFF_SECS: u64 = 8;

/// Keepalive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How often the read loop re-checks the shutdown flag while idle.
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

/// Minimum field count for a decodable candle entry.
const MIN_CANDLE_FIELDS: usize = 15;

/// Timestamp format used by the feed, e.g. `20210506-200000.000-0400`.
const EVENT_TIME_FORMAT: &str = "%Y%m%d-%H%M%S%.3f%z";

/// One parsed candle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    /// Upstream symbol, e.g. `AAPL{=1m}`
    pub event_symbol: String,
    /// Event timestamp (always UTC)
    pub event_time: DateTime<Utc>,
    /// Candle period start (always UTC)
    pub time: DateTime<Utc>,
    /// Monotonic per-symbol sequence number
    pub sequence: i64,
    /// Number of trades aggregated into the candle
    pub count: i64,
    /// Opening price
    pub open: Decimal,
    /// Highest price
    pub high: Decimal,
    /// Lowest price
    pub low: Decimal,
    /// Closing price
    pub close: Decimal,
    /// Total volume
    pub volume: Decimal,
    /// Volume-weighted average price
    pub vwap: Decimal,
    /// Buy-side volume
    pub bid_volume: Decimal,
    /// Sell-side volume
    pub ask_volume: Decimal,
    /// Implied volatility, absent when the feed reports none
    pub imp_volatility: Option<f64>,
    /// Open interest, absent when the feed reports none
    pub open_interest: Option<Decimal>,
    /// Raw event flags
    pub event_flags: String,
}

impl CandleRecord {
    /// Normalize nullable numeric fields before persistence. Non-finite
    /// implied-volatility values become absent.
    pub fn normalize(&mut self) {
        if let Some(iv) = self.imp_volatility {
            if !iv.is_finite() {
                self.imp_volatility = None;
            }
        }
    }
}

/// Inbound message envelope: `{"type": ..., "data": ...}`.
#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    data: Value,
}

/// Parse a feed timestamp into a UTC instant.
fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_str(raw, EVENT_TIME_FORMAT) {
        Ok(parsed) => Some(parsed.with_timezone(&Utc)),
        Err(e) => {
            warn!("timestamp parse error for {raw:?}: {e}");
            None
        }
    }
}

/// Decode a required decimal field. The feed sends both JSON numbers and
/// numeric strings; "NaN" never parses.
fn decimal_field(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// Decode a nullable decimal field, normalizing "NaN" and null to absent.
fn nullable_decimal_field(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) if s == "NaN" => None,
        Value::Null => None,
        other => decimal_field(other),
    }
}

/// Decode a nullable float field, normalizing "NaN" and null to absent.
fn nullable_float_field(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::String(s) if s == "NaN" => None,
        Value::String(s) => f64::from_str(s).ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Decode a required integer field.
fn int_field(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => i64::from_str(s).ok(),
        _ => None,
    }
}

/// Decode one raw candle entry into a record.
///
/// Short entries and entries with unparseable timestamps or prices are
/// rejected with a log line; nothing here can abort the stream.
fn decode_candle(fields: &[Value]) -> Option<CandleRecord> {
    if fields.len() < MIN_CANDLE_FIELDS {
        warn!("incomplete candle entry: {} fields", fields.len());
        return None;
    }

    let event_symbol = fields[0].as_str()?.to_string();

    let event_time = parse_event_time(fields[1].as_str()?)?;
    let time = parse_event_time(fields[2].as_str()?)?;

    let record = CandleRecord {
        event_symbol,
        event_time,
        time,
        sequence: int_field(&fields[3])?,
        count: int_field(&fields[4])?,
        open: decimal_field(&fields[5])?,
        high: decimal_field(&fields[6])?,
        low: decimal_field(&fields[7])?,
        close: decimal_field(&fields[8])?,
        volume: decimal_field(&fields[9])?,
        vwap: decimal_field(&fields[10])?,
        bid_volume: decimal_field(&fields[11])?,
        ask_volume: decimal_field(&fields[12])?,
        imp_volatility: nullable_float_field(&fields[13]),
        open_interest: nullable_decimal_field(&fields[14]),
        event_flags: fields
            .get(15)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    };

    Some(record)
}

/// WebSocket client streaming candle events into the record channel.
pub struct DxLinkStreamClient {
    /// Streaming endpoint URL
    url: String,
    /// Session supplying the handshake credential
    session: Arc<SessionManager>,
    /// Candle symbols to subscribe to
    symbols: Vec<String>,
    /// Channel sender for decoded records
    candle_tx: mpsc::Sender<CandleRecord>,
    /// Connection status
    is_connected: Arc<AtomicBool>,
    /// Total records decoded and forwarded
    candles_decoded: Arc<AtomicU64>,
    /// Total malformed records dropped
    records_dropped: Arc<AtomicU64>,
    /// Timestamp of the most recent decoded event
    last_event_time: Arc<RwLock<Option<DateTime<Utc>>>>,
    /// Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl DxLinkStreamClient {
    /// Create a new streaming client.
    pub fn new(
        url: impl Into<String>,
        session: Arc<SessionManager>,
        symbols: Vec<String>,
        candle_tx: mpsc::Sender<CandleRecord>,
    ) -> Self {
        Self {
            url: url.into(),
            session,
            symbols,
            candle_tx,
            is_connected: Arc::new(AtomicBool::new(false)),
            candles_decoded: Arc::new(AtomicU64::new(0)),
            records_dropped: Arc::new(AtomicU64::new(0)),
            last_event_time: Arc::new(RwLock::new(None)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if the client is currently connected.
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    /// Get the total number of candles decoded.
    pub fn candles_decoded(&self) -> u64 {
        self.candles_decoded.load(Ordering::SeqCst)
    }

    /// Get the total number of malformed records dropped.
    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::SeqCst)
    }

    /// Timestamp of the most recent decoded event.
    pub fn last_event_time(&self) -> Option<DateTime<Utc>> {
        *self.last_event_time.read()
    }

    /// Signal the client to shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run the streaming client with auto-reconnection.
    ///
    /// Any break in the connection waits out an exponential backoff and
    /// reconnects; only the shutdown signal exits the loop. One connection
    /// attempt is in flight at any time.
    pub async fn run(&self) -> Result<()> {
        let mut backoff_secs = 1u64;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("stream client shutting down");
                break;
            }

            match self.connect_and_listen().await {
                Ok(_) => {
                    info!("stream connection ended");
                    backoff_secs = 1;
                }
                Err(e) => {
                    error!("stream connection error: {e}");
                }
            }

            self.is_connected.store(false, Ordering::SeqCst);

            if self.shutdown.load(Ordering::SeqCst) {
                info!("stream client shutting down");
                break;
            }

            warn!("reconnecting in {backoff_secs} seconds");
            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }

        Ok(())
    }

    /// Connect, run the handshake, and process messages until the
    /// connection breaks or shutdown is signalled.
    async fn connect_and_listen(&self) -> Result<()> {
        info!("connecting to candle stream: {}", self.url);

        let (ws_stream, response) = connect_async(self.url.as_str()).await?;
        info!("stream connected, status: {}", response.status());

        let (mut write, mut read) = ws_stream.split();

        // Handshake: authenticate with the live session credential, then
        // subscribe to candle events for the configured symbols.
        let token = self.session.session_token().unwrap_or_default();
        let auth = serde_json::json!({
            "action": "authenticate",
            "token": token,
        });
        write.send(Message::Text(auth.to_string())).await?;
        debug!("sent authentication message");

        let subscribe = serde_json::json!({
            "action": "subscribe",
            "types": ["Candle"],
            "symbols": self.symbols,
        });
        write.send(Message::Text(subscribe.to_string())).await?;
        info!("subscribed to candles for {} symbols", self.symbols.len());

        self.is_connected.store(true, Ordering::SeqCst);

        // Keepalive pings
        let shutdown = self.shutdown.clone();
        let ping_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if write.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        });

        let result = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }

            let msg = tokio::select! {
                msg = read.next() => msg,
                _ = tokio::time::sleep(SHUTDOWN_POLL) => continue,
            };

            let Some(msg) = msg else {
                info!("stream closed by upstream");
                break Ok(());
            };

            match msg {
                Ok(Message::Text(text)) => {
                    if let Err(e) = self.handle_text(&text).await {
                        if matches!(e, FeederError::Channel(_)) {
                            warn!("record channel closed, stopping stream reader");
                            break Ok(());
                        }
                        warn!("error handling stream message: {e}");
                    }
                }
                Ok(Message::Ping(_)) => {
                    debug!("received ping");
                }
                Ok(Message::Pong(_)) => {
                    debug!("received pong");
                }
                Ok(Message::Close(frame)) => {
                    info!("stream closed: {frame:?}");
                    break Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    break Err(e.into());
                }
            }
        };

        ping_handle.abort();
        self.is_connected.store(false, Ordering::SeqCst);
        result
    }

    /// Handle one inbound text frame.
    ///
    /// Only FEED_DATA envelopes are acted on; within them, only entries
    /// tagged as candle records are decoded. Everything else is ignored
    /// without error.
    async fn handle_text(&self, text: &str) -> Result<()> {
        let message: StreamMessage = serde_json::from_str(text)?;

        if message.msg_type != "FEED_DATA" {
            debug!("ignoring message of type {}", message.msg_type);
            return Ok(());
        }

        let Some(events) = message.data.as_array() else {
            return Ok(());
        };

        for entry in events {
            let Some(pair) = entry.as_array() else {
                continue;
            };
            if pair.first().and_then(Value::as_str) != Some("Candle") {
                continue;
            }
            let Some(fields) = pair.get(1).and_then(Value::as_array) else {
                continue;
            };

            match decode_candle(fields) {
                Some(record) => {
                    *self.last_event_time.write() = Some(record.event_time);
                    if self.candle_tx.send(record).await.is_err() {
                        return Err(FeederError::channel("candle receiver dropped"));
                    }
                    self.candles_decoded.fetch_add(1, Ordering::SeqCst);
                }
                None => {
                    self.records_dropped.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_candle_fields() -> Vec<Value> {
        serde_json::json!([
            "AAPL{=1m}",
            "20210506-200000.000-0400",
            "20210506-200000.000-0400",
            123456,
            10,
            "126.50",
            "127.00",
            "126.10",
            "126.85",
            "1000000",
            "126.60",
            "600000",
            "400000",
            "0.25",
            "NaN",
            "0"
        ])
        .as_array()
        .unwrap()
        .clone()
    }

    fn client() -> (DxLinkStreamClient, mpsc::Receiver<CandleRecord>) {
        let session = Arc::new(SessionManager::new("https://api.invalid", "tests/0.1"));
        let (tx, rx) = mpsc::channel(16);
        let client = DxLinkStreamClient::new(
            "wss://stream.invalid",
            session,
            vec!["AAPL{=1m}".to_string()],
            tx,
        );
        (client, rx)
    }

    #[test]
    fn event_time_decodes_to_utc() {
        let parsed = parse_event_time("20210506-200000.000-0400").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2021-05-07T00:00:00+00:00");
    }

    #[test]
    fn garbage_event_time_is_rejected() {
        assert!(parse_event_time("2021-05-06 20:00:00").is_none());
        assert!(parse_event_time("").is_none());
    }

    #[test]
    fn full_candle_entry_decodes() {
        let record = decode_candle(&raw_candle_fields()).unwrap();

        assert_eq!(record.event_symbol, "AAPL{=1m}");
        assert_eq!(record.event_time.to_rfc3339(), "2021-05-07T00:00:00+00:00");
        assert_eq!(record.sequence, 123456);
        assert_eq!(record.count, 10);
        assert_eq!(record.open, Decimal::from_str("126.50").unwrap());
        assert_eq!(record.high, Decimal::from_str("127.00").unwrap());
        assert_eq!(record.low, Decimal::from_str("126.10").unwrap());
        assert_eq!(record.close, Decimal::from_str("126.85").unwrap());
        assert_eq!(record.volume, Decimal::from_str("1000000").unwrap());
        assert_eq!(record.vwap, Decimal::from_str("126.60").unwrap());
        assert_eq!(record.imp_volatility, Some(0.25));
        assert_eq!(record.event_flags, "0");
    }

    #[test]
    fn short_entry_yields_no_record() {
        let mut fields = raw_candle_fields();
        fields.truncate(14);
        assert!(decode_candle(&fields).is_none());
    }

    #[test]
    fn nan_open_interest_becomes_absent() {
        let record = decode_candle(&raw_candle_fields()).unwrap();
        assert!(record.open_interest.is_none());

        let mut fields = raw_candle_fields();
        fields[14] = Value::String("4200".to_string());
        let record = decode_candle(&fields).unwrap();
        assert_eq!(record.open_interest, Some(Decimal::from_str("4200").unwrap()));
    }

    #[test]
    fn nan_implied_volatility_becomes_absent() {
        let mut fields = raw_candle_fields();
        fields[13] = Value::String("NaN".to_string());
        let record = decode_candle(&fields).unwrap();
        assert!(record.imp_volatility.is_none());
    }

    #[test]
    fn unparseable_timestamp_drops_the_record() {
        let mut fields = raw_candle_fields();
        fields[1] = Value::String("not-a-timestamp".to_string());
        assert!(decode_candle(&fields).is_none());
    }

    #[test]
    fn missing_event_flags_default_to_empty() {
        let mut fields = raw_candle_fields();
        fields.truncate(15);
        let record = decode_candle(&fields).unwrap();
        assert_eq!(record.event_flags, "");
    }

    #[test]
    fn normalize_clears_non_finite_volatility() {
        let mut record = decode_candle(&raw_candle_fields()).unwrap();
        record.imp_volatility = Some(f64::INFINITY);
        record.normalize();
        assert!(record.imp_volatility.is_none());

        let mut record = decode_candle(&raw_candle_fields()).unwrap();
        record.normalize();
        assert_eq!(record.imp_volatility, Some(0.25));
    }

    #[tokio::test]
    async fn feed_data_routes_candles_and_ignores_the_rest() {
        let (client, mut rx) = client();

        let envelope = serde_json::json!({
            "type": "FEED_DATA",
            "data": [
                ["Quote", ["AAPL", "126.50", "126.55"]],
                ["Candle", raw_candle_fields()],
            ],
        });
        client.handle_text(&envelope.to_string()).await.unwrap();

        let record = rx.try_recv().unwrap();
        assert_eq!(record.event_symbol, "AAPL{=1m}");
        assert!(rx.try_recv().is_err());
        assert_eq!(client.candles_decoded(), 1);
        assert_eq!(client.last_event_time(), Some(record.event_time));
    }

    #[tokio::test]
    async fn non_feed_data_messages_are_ignored() {
        let (client, mut rx) = client();

        let keepalive = serde_json::json!({"type": "KEEPALIVE"});
        client.handle_text(&keepalive.to_string()).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(client.candles_decoded(), 0);
    }

    #[tokio::test]
    async fn short_candle_entry_is_counted_as_dropped() {
        let (client, mut rx) = client();

        let mut fields = raw_candle_fields();
        fields.truncate(10);
        let envelope = serde_json::json!({
            "type": "FEED_DATA",
            "data": [["Candle", fields]],
        });
        client.handle_text(&envelope.to_string()).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(client.candles_decoded(), 0);
        assert_eq!(client.records_dropped(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_surfaces_a_json_error() {
        let (client, _rx) = client();
        let result = client.handle_text("this is not json").await;
        assert!(matches!(result, Err(FeederError::Json(_))));
    }
}
