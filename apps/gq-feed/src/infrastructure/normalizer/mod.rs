//! Message Normalizer
//!
//! Converts exchange-native payloads into canonical [`TickerData`] records.
//!
//! # Outcomes
//!
//! - `Ok(TickerData)`: a validated record
//! - [`NormalizeErrorKind::Parse`]: the payload is not well-formed for the
//!   exchange encoding
//! - [`NormalizeErrorKind::Schema`]: the payload parsed but breaks a
//!   canonical invariant; never clamped or repaired
//! - [`NormalizeErrorKind::Control`]: a well-formed protocol frame with no
//!   market data (acks, heartbeats, status)
//!
//! # Encodings
//!
//! | Exchange | Format |
//! |----------|--------|
//! | any      | gateway envelope (canonical JSON with `ohlcv`/`quote`) |
//! | Binance  | `24hrTicker`, `trade`, `bookTicker` objects |
//! | Coinbase | `ticker`, `match`, `snapshot`/`l2update` objects |
//! | Kraken   | v2 `{channel, type, data}` envelopes |
//! | Bitfinex | v2 positional arrays |
//!
//! A normalizer belongs to one descriptor and keeps its event-time
//! watermarks and order book, so it must outlive reconnects of that
//! descriptor. Exchange-stamped and ingestion-stamped event times are two
//! clocks and are ordered separately.

mod binance;
mod bitfinex;
mod book;
mod codec;
mod coinbase;
mod gateway;
mod kraken;

use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::domain::registry::{DataType, Exchange, ExchangeDescriptor};
use crate::domain::streaming::{MarketTime, Ohlcv, Quote, SchemaViolation, TickerData, Trade};
use self::book::{BookMessage, OrderBook};

// =============================================================================
// Errors
// =============================================================================

/// Normalization failure for one raw message.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    /// Payload is not valid JSON.
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is JSON but not shaped like the exchange's messages.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// Message type does not belong to this stream's data type.
    #[error("unexpected message type {0:?} for this stream")]
    UnexpectedType(String),

    /// Record breaks a canonical invariant.
    #[error("schema violation: {0}")]
    Schema(#[from] SchemaViolation),

    /// Protocol frame without market data.
    #[error("control frame: {0}")]
    Control(String),
}

/// Coarse classification of a [`NormalizeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeErrorKind {
    /// Malformed payload.
    Parse,
    /// Invariant violation.
    Schema,
    /// Not market data.
    Control,
}

impl NormalizeError {
    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> NormalizeErrorKind {
        match self {
            Self::Json(_) | Self::InvalidFormat(_) | Self::UnexpectedType(_) => {
                NormalizeErrorKind::Parse
            }
            Self::Schema(_) => NormalizeErrorKind::Schema,
            Self::Control(_) => NormalizeErrorKind::Control,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidFormat(message.into())
    }

    pub(crate) fn control(message: impl Into<String>) -> Self {
        Self::Control(message.into())
    }
}

// =============================================================================
// Decoded Messages
// =============================================================================

/// Market fields extracted from one exchange message, before identity and
/// ingestion stamps are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MarketUpdate {
    /// Symbol carried by the message, if any.
    pub symbol: Option<String>,
    /// Exchange channel ID, for encodings that omit the symbol.
    pub channel_id: Option<i64>,
    pub ohlcv: Ohlcv,
    pub quote: Quote,
    pub trade: Trade,
    pub open_time: i64,
    pub close_time: i64,
    /// Exchange event time, if the message has one.
    pub event_time: Option<i64>,
}

/// Result of decoding one exchange message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// Market data.
    Update(Box<MarketUpdate>),
    /// Order book levels, to be applied to the descriptor's book.
    Book(Box<BookMessage>),
    /// A channel ID was bound to a symbol.
    Subscribed {
        /// Exchange channel ID.
        channel_id: i64,
        /// Symbol of the channel.
        symbol: String,
    },
}

// =============================================================================
// Normalizer
// =============================================================================

/// Per-descriptor normalizer.
///
/// # Example
///
/// ```rust
/// use gq_feed::domain::registry::ExchangeRegistry;
/// use gq_feed::infrastructure::normalizer::Normalizer;
///
/// let descriptor = ExchangeRegistry::parse_channel("coinbase.spot.trade.BTC-USD").unwrap();
/// let mut normalizer = Normalizer::new(descriptor);
///
/// let record = normalizer
///     .normalize(r#"{"type":"match","trade_id":10,"product_id":"BTC-USD","size":"0.5","price":"400.23","time":"2023-03-08T22:19:17.000Z"}"#)
///     .unwrap();
/// assert_eq!(record.exchange, "coinbase");
/// assert_eq!(record.trade.num_trades, 1);
/// ```
#[derive(Debug)]
pub struct Normalizer {
    descriptor: ExchangeDescriptor,
    exchange_watermark: Option<i64>,
    ingestion_watermark: Option<i64>,
    channel_symbols: HashMap<i64, String>,
    book: OrderBook,
}

/// Where a record's event time came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clock {
    /// Stamped by the exchange.
    Exchange,
    /// The message carried no time; stamped on ingestion.
    Ingestion,
}

impl Normalizer {
    /// Create a normalizer for one descriptor.
    #[must_use]
    pub fn new(descriptor: ExchangeDescriptor) -> Self {
        Self {
            descriptor,
            exchange_watermark: None,
            ingestion_watermark: None,
            channel_symbols: HashMap::new(),
            book: OrderBook::default(),
        }
    }

    /// Descriptor this normalizer serves.
    #[must_use]
    pub const fn descriptor(&self) -> &ExchangeDescriptor {
        &self.descriptor
    }

    /// Exchange event time of the last accepted exchange-stamped record.
    #[must_use]
    pub const fn last_event_time(&self) -> Option<i64> {
        self.exchange_watermark
    }

    /// Normalize one raw message.
    ///
    /// # Errors
    ///
    /// See [`NormalizeErrorKind`] for the classes of failure.
    pub fn normalize(&mut self, raw: &str) -> Result<TickerData, NormalizeError> {
        let now = Utc::now();
        self.normalize_at(raw, now.timestamp_millis())
    }

    /// Normalize with an explicit ingestion instant (Unix epoch ms).
    pub(crate) fn normalize_at(
        &mut self,
        raw: &str,
        ingested_ms: i64,
    ) -> Result<TickerData, NormalizeError> {
        let value = codec::parse_json(raw)?;
        let data_type = self.descriptor.data_type();

        if let Some(envelope) = gateway::detect(&value) {
            let record = gateway::decode(envelope, &self.descriptor)?;
            return self.finish_envelope(record, ingested_ms);
        }

        let decoded = match self.descriptor.exchange() {
            Exchange::Binance => binance::decode(data_type, value)?,
            Exchange::Coinbase => coinbase::decode(data_type, value)?,
            Exchange::Kraken => kraken::decode(data_type, value)?,
            Exchange::Bitfinex => bitfinex::decode(data_type, &value)?,
        };

        match decoded {
            Decoded::Update(update) => self.finish(*update, ingested_ms),
            Decoded::Book(message) => self.finish_book(*message, ingested_ms),
            Decoded::Subscribed { channel_id, symbol } => {
                let message = format!("channel {channel_id} bound to {symbol}");
                self.channel_symbols.insert(channel_id, symbol);
                Err(NormalizeError::Control(message))
            }
        }
    }

    fn resolve_symbol(&self, symbol: Option<String>, channel_id: Option<i64>) -> String {
        match (symbol, channel_id) {
            (Some(symbol), _) => symbol,
            (None, Some(channel_id)) => self
                .channel_symbols
                .get(&channel_id)
                .cloned()
                .unwrap_or_else(|| self.descriptor.symbol().to_string()),
            (None, None) => self.descriptor.symbol().to_string(),
        }
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), NormalizeError> {
        if symbol == self.descriptor.symbol() {
            return Ok(());
        }
        Err(SchemaViolation::SymbolMismatch {
            expected: self.descriptor.symbol().to_string(),
            actual: symbol.to_string(),
        }
        .into())
    }

    fn finish(
        &mut self,
        update: MarketUpdate,
        ingested_ms: i64,
    ) -> Result<TickerData, NormalizeError> {
        let symbol = self.resolve_symbol(update.symbol, update.channel_id);
        let (event_time, clock) = match update.event_time {
            Some(event_time) => (event_time, Clock::Exchange),
            None => (ingested_ms, Clock::Ingestion),
        };

        let record = TickerData {
            ohlcv: update.ohlcv,
            quote: update.quote,
            time: MarketTime {
                open_time: update.open_time,
                close_time: update.close_time,
                event_time,
                gq_published: String::new(),
            },
            trade: update.trade,
            ..TickerData::default()
        };
        self.accept(record, &symbol, clock, ingested_ms)
    }

    /// Apply book levels, then emit the resulting top of book.
    ///
    /// Levels for another symbol never reach the book.
    fn finish_book(
        &mut self,
        message: BookMessage,
        ingested_ms: i64,
    ) -> Result<TickerData, NormalizeError> {
        let symbol = self.resolve_symbol(message.symbol.clone(), message.channel_id);
        self.check_symbol(&symbol)?;
        message.check_levels()?;

        self.book.apply(&message);
        let update = codec::book_update(Some(symbol), self.book.top(), message.event_time)?;
        self.finish(update, ingested_ms)
    }

    fn finish_envelope(
        &mut self,
        mut record: TickerData,
        ingested_ms: i64,
    ) -> Result<TickerData, NormalizeError> {
        let symbol = if record.symbol.is_empty() {
            self.descriptor.symbol().to_string()
        } else {
            std::mem::take(&mut record.symbol)
        };
        let clock = if record.time.event_time == 0 {
            record.time.event_time = ingested_ms;
            Clock::Ingestion
        } else {
            Clock::Exchange
        };
        self.accept(record, &symbol, clock, ingested_ms)
    }

    /// Stamp identity, check invariants and advance the watermark of `clock`.
    fn accept(
        &mut self,
        mut record: TickerData,
        symbol: &str,
        clock: Clock,
        ingested_ms: i64,
    ) -> Result<TickerData, NormalizeError> {
        self.check_symbol(symbol)?;
        record.validate()?;

        let watermark = match clock {
            Clock::Exchange => &mut self.exchange_watermark,
            Clock::Ingestion => &mut self.ingestion_watermark,
        };
        let event_time = record.time.event_time;
        if let Some(previous) = *watermark
            && event_time < previous
        {
            return Err(SchemaViolation::EventTimeRegression {
                previous,
                current: event_time,
            }
            .into());
        }
        *watermark = Some(event_time);

        record.id = uuid::Uuid::new_v4().to_string();
        record.exchange = self.descriptor.exchange().as_str().to_string();
        record.asset_class = self.descriptor.asset_class().as_str().to_string();
        record.data_type = self.descriptor.data_type().as_str().to_string();
        record.symbol = self.descriptor.symbol().to_string();
        record.channel = self.descriptor.channel();
        record.time.gq_published = ingested_ms.div_euclid(1000).to_string();

        Ok(record)
    }
}

/// Reject a message type that does not belong to the stream's data type.
pub(crate) fn expect_data_type(
    expected: DataType,
    actual: DataType,
    message_type: &str,
) -> Result<(), NormalizeError> {
    if expected == actual {
        Ok(())
    } else {
        Err(NormalizeError::UnexpectedType(message_type.to_string()))
    }
}

/// Percentage change of `change` relative to `open`, zero when `open` is zero.
pub(crate) fn percent_change(change: Decimal, open: Decimal) -> Decimal {
    if open.is_zero() {
        return Decimal::ZERO;
    }
    change
        .checked_div(open)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .map_or(Decimal::ZERO, |pct| pct.round_dp(4))
}

/// Value of the JSON `type`-like tag at `key`.
pub(crate) fn tag<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registry::ExchangeRegistry;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    const NOW_MS: i64 = 1_678_313_957_123;

    fn normalizer(channel: &str) -> Normalizer {
        Normalizer::new(ExchangeRegistry::parse_channel(channel).unwrap())
    }

    fn coinbase_match(price: &str, size: &str, time: &str) -> String {
        format!(
            r#"{{"type":"match","trade_id":42,"sequence":1,"product_id":"BTC-USD","size":"{size}","price":"{price}","side":"sell","time":"{time}"}}"#
        )
    }

    #[test]
    fn identity_is_stamped_from_descriptor() {
        let mut n = normalizer("coinbase.spot.trade.BTC-USD");
        let record = n
            .normalize_at(
                &coinbase_match("400.23", "0.5", "2023-03-08T22:19:17.000Z"),
                NOW_MS,
            )
            .unwrap();

        assert_eq!(record.exchange, "coinbase");
        assert_eq!(record.asset_class, "spot");
        assert_eq!(record.data_type, "trade");
        assert_eq!(record.symbol, "BTC-USD");
        assert_eq!(record.channel, "coinbase.spot.trade.BTC-USD");
        assert_eq!(record.time.gq_published, "1678313957");
        assert_eq!(record.id.len(), 36);
    }

    #[test]
    fn every_record_gets_a_fresh_id() {
        let mut n = normalizer("coinbase.spot.trade.BTC-USD");
        let raw = coinbase_match("400.23", "0.5", "2023-03-08T22:19:17.000Z");
        let a = n.normalize_at(&raw, NOW_MS).unwrap();
        let b = n.normalize_at(&raw, NOW_MS).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn event_time_regression_is_dropped_not_reordered() {
        let mut n = normalizer("coinbase.spot.trade.BTC-USD");
        n.normalize_at(
            &coinbase_match("400", "1", "2023-03-08T22:19:17.000Z"),
            NOW_MS,
        )
        .unwrap();

        let err = n
            .normalize_at(
                &coinbase_match("401", "1", "2023-03-08T22:19:16.000Z"),
                NOW_MS,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::Schema(SchemaViolation::EventTimeRegression { .. })
        ));
        assert_eq!(err.kind(), NormalizeErrorKind::Schema);

        // Watermark is unchanged; an equal timestamp is still accepted
        let record = n
            .normalize_at(
                &coinbase_match("402", "1", "2023-03-08T22:19:17.000Z"),
                NOW_MS,
            )
            .unwrap();
        assert_eq!(record.ohlcv.close_price, dec!(402));
    }

    #[test]
    fn symbol_mismatch_is_schema_violation() {
        let mut n = normalizer("coinbase.spot.trade.ETH-USD");
        let err = n
            .normalize_at(
                &coinbase_match("400", "1", "2023-03-08T22:19:17.000Z"),
                NOW_MS,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::Schema(SchemaViolation::SymbolMismatch { .. })
        ));
    }

    #[test]
    fn malformed_payload_is_parse_error() {
        let mut n = normalizer("binance.spot.trade.BTCUSDT");
        let err = n.normalize_at("not json", NOW_MS).unwrap_err();
        assert_eq!(err.kind(), NormalizeErrorKind::Parse);
        assert!(n.last_event_time().is_none());
    }

    #[test]
    fn missing_event_time_uses_ingestion_time() {
        let mut n = normalizer("binance.spot.book.BNBUSDT");
        let record = n
            .normalize_at(
                r#"{"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}"#,
                NOW_MS,
            )
            .unwrap();
        assert_eq!(record.time.event_time, NOW_MS);
    }

    const COINBASE_SNAPSHOT: &str = r#"{"type":"snapshot","product_id":"BTC-USD","bids":[["100","1"],["99","2"]],"asks":[["101","1"],["102","4"]]}"#;

    fn coinbase_l2update(time: &str, changes: &str) -> String {
        format!(
            r#"{{"type":"l2update","product_id":"BTC-USD","time":"{time}","changes":{changes}}}"#
        )
    }

    #[test]
    fn l2update_after_ingestion_stamped_snapshot_is_accepted() {
        let mut n = normalizer("coinbase.spot.book.BTC-USD");
        let snapshot = n.normalize_at(COINBASE_SNAPSHOT, NOW_MS).unwrap();
        assert_eq!(snapshot.time.event_time, NOW_MS);

        // Exchange time 50ms before the snapshot was ingested
        let update = n
            .normalize_at(
                &coinbase_l2update("2023-03-08T22:19:17.073Z", r#"[["buy","99.5","3"]]"#),
                NOW_MS + 10,
            )
            .unwrap();
        assert_eq!(update.time.event_time, 1_678_313_957_073);
        assert_eq!(update.quote.bid_price, dec!(100));
        assert_eq!(n.last_event_time(), Some(1_678_313_957_073));
    }

    #[test]
    fn exchange_clock_regression_is_still_dropped_after_snapshot() {
        let mut n = normalizer("coinbase.spot.book.BTC-USD");
        n.normalize_at(COINBASE_SNAPSHOT, NOW_MS).unwrap();
        n.normalize_at(
            &coinbase_l2update("2023-03-08T22:19:17.073Z", r#"[["buy","99.5","3"]]"#),
            NOW_MS,
        )
        .unwrap();

        let err = n
            .normalize_at(
                &coinbase_l2update("2023-03-08T22:19:17.072Z", r#"[["buy","99.6","3"]]"#),
                NOW_MS,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::Schema(SchemaViolation::EventTimeRegression { .. })
        ));
    }

    #[test]
    fn book_delta_below_best_bid_keeps_best_bid() {
        let mut n = normalizer("coinbase.spot.book.BTC-USD");
        n.normalize_at(COINBASE_SNAPSHOT, NOW_MS).unwrap();

        let record = n
            .normalize_at(
                &coinbase_l2update("2023-03-08T22:19:18.000Z", r#"[["buy","98","5"]]"#),
                NOW_MS,
            )
            .unwrap();
        assert_eq!(record.quote.bid_price, dec!(100));
        assert_eq!(record.quote.bid_qty, dec!(1));
        assert_eq!(record.quote.ask_price, dec!(101));
        assert_eq!(record.quote.ask_qty, dec!(1));
    }

    #[test]
    fn removing_best_level_moves_to_next_level() {
        let mut n = normalizer("coinbase.spot.book.BTC-USD");
        n.normalize_at(COINBASE_SNAPSHOT, NOW_MS).unwrap();

        let record = n
            .normalize_at(
                &coinbase_l2update(
                    "2023-03-08T22:19:18.000Z",
                    r#"[["buy","100.00","0"],["sell","101","0"]]"#,
                ),
                NOW_MS,
            )
            .unwrap();
        assert_eq!(record.quote.bid_price, dec!(99));
        assert_eq!(record.quote.bid_qty, dec!(2));
        assert_eq!(record.quote.ask_price, dec!(102));
        assert_eq!(record.quote.ask_qty, dec!(4));
    }

    #[test]
    fn emptied_book_is_control() {
        let mut n = normalizer("bitfinex.spot.book.tBTCUSD");
        n.normalize_at(
            r#"{"event":"subscribed","channel":"book","chanId":17091,"symbol":"tBTCUSD"}"#,
            NOW_MS,
        )
        .unwrap_err();
        n.normalize_at("[17091,[[7254.7,1,0.5],[7254.8,2,-1.2]]]", NOW_MS)
            .unwrap();

        let record = n.normalize_at("[17091,[7254.7,0,1]]", NOW_MS).unwrap();
        assert!(!record.quote.has_bid());
        assert_eq!(record.quote.ask_price, dec!(7254.8));

        let err = n.normalize_at("[17091,[7254.8,0,-1]]", NOW_MS).unwrap_err();
        assert_eq!(err.kind(), NormalizeErrorKind::Control);
    }

    #[test]
    fn book_levels_for_another_symbol_leave_book_untouched() {
        let mut n = normalizer("coinbase.spot.book.BTC-USD");
        n.normalize_at(COINBASE_SNAPSHOT, NOW_MS).unwrap();

        let foreign = r#"{"type":"l2update","product_id":"ETH-USD","time":"2023-03-08T22:19:18.000Z","changes":[["buy","100","0"]]}"#;
        let err = n.normalize_at(foreign, NOW_MS).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::Schema(SchemaViolation::SymbolMismatch { .. })
        ));
        assert_eq!(n.book.top().bid_price, dec!(100));
    }

    #[test]
    fn gateway_envelope_for_another_exchange_is_rejected() {
        let mut n = normalizer("binance.spot.ticker.BTCUSDT");
        let foreign = r#"{"exchange":"kraken","assetClass":"spot","type":"ticker","symbol":"BTCUSDT","ohlcv":{"closePrice":1.0,"highPrice":1.0}}"#;
        let err = n.normalize_at(foreign, NOW_MS).unwrap_err();
        assert!(matches!(err, NormalizeError::UnexpectedType(_)));
        assert_eq!(err.kind(), NormalizeErrorKind::Parse);

        let own = r#"{"exchange":"binance","assetClass":"spot","type":"ticker","symbol":"BTCUSDT","ohlcv":{"closePrice":1.0,"highPrice":1.0}}"#;
        let record = n.normalize_at(own, NOW_MS).unwrap();
        assert_eq!(record.time.event_time, NOW_MS);
        assert_eq!(record.channel, "binance.spot.ticker.BTCUSDT");
    }

    #[test]
    fn percent_change_handles_zero_open() {
        assert_eq!(percent_change(dec!(5), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(percent_change(dec!(5), dec!(100)), dec!(5));
        assert_eq!(percent_change(dec!(-1), dec!(3)), dec!(-33.3333));
    }

    proptest! {
        #[test]
        fn yielded_event_times_never_decrease(times in proptest::collection::vec(0i64..10_000, 1..50)) {
            let mut n = normalizer("binance.spot.trade.BTCUSDT");
            let mut last = i64::MIN;
            for (i, t) in times.iter().enumerate() {
                let raw = format!(
                    r#"{{"e":"trade","E":{t},"s":"BTCUSDT","t":{i},"p":"10.0","q":"1.0","T":{t},"m":true,"M":true}}"#
                );
                if let Ok(record) = n.normalize_at(&raw, NOW_MS) {
                    prop_assert!(record.time.event_time >= last);
                    last = record.time.event_time;
                }
            }
        }

        #[test]
        fn trade_records_hold_ohlc_invariants(price in 1u32..1_000_000, qty in 0u32..1_000_000) {
            let mut n = normalizer("binance.spot.trade.BTCUSDT");
            let raw = format!(
                r#"{{"e":"trade","E":1,"s":"BTCUSDT","t":1,"p":"{price}.25","q":"{qty}.5","T":1,"m":false,"M":true}}"#
            );
            let record = n.normalize_at(&raw, NOW_MS).unwrap();
            let o = &record.ohlcv;
            prop_assert!(o.low_price <= o.open_price.min(o.close_price));
            prop_assert!(o.high_price >= o.open_price.max(o.close_price));
            prop_assert!(o.volume >= Decimal::ZERO);
            prop_assert!(record.time.open_time <= record.time.close_time);
        }
    }
}
