//! Market Data Streaming Types
//!
//! The canonical record shapes produced for every exchange: OHLC, quote,
//! market time, trade statistics and the `TickerData` envelope. These types
//! are codec-agnostic; the normalizer builds them and checks their
//! invariants before handing them to a consumer.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {
//!   "_id": "5b0e…",
//!   "assetClass": "spot",
//!   "channel": "coinbase.spot.trade.BTC-USD",
//!   "exchange": "coinbase",
//!   "type": "trade",
//!   "symbol": "BTC-USD",
//!   "ohlcv": {"openPrice": 1.0, "highPrice": 1.0, "lowPrice": 1.0, "closePrice": 1.0, "volume": 0.5},
//!   "quote": {"bidPrice": 0, "bidQty": 0, "askPrice": 0, "askQty": 0, "priceChange": 0, "percentPriceChange": 0, "quoteVolume": 0},
//!   "time": {"openTime": 0, "closeTime": 0, "eventTime": 1678313957000, "gqPublished": "1678313957"},
//!   "trade": {"firstTradeId": 1, "numTrades": 1, "lastTradeQty": 0.5, "weightedAvgPrice": 1.0}
//! }
//! ```
//!
//! Prices serialize as JSON numbers; missing numeric fields deserialize as
//! zero.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Record Shapes
// =============================================================================

/// Open/high/low/close prices and traded volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ohlcv {
    /// Opening price.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub open_price: Decimal,
    /// Highest price.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub high_price: Decimal,
    /// Lowest price.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub low_price: Decimal,
    /// Closing (last) price.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub close_price: Decimal,
    /// Base-asset volume.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub volume: Decimal,
}

impl Ohlcv {
    /// A single-price bar, as produced by one trade.
    #[must_use]
    pub const fn point(price: Decimal, volume: Decimal) -> Self {
        Self {
            open_price: price,
            high_price: price,
            low_price: price,
            close_price: price,
            volume,
        }
    }
}

/// Best bid/ask and rolling price change.
///
/// A side whose price is zero is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Best bid price.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub bid_price: Decimal,
    /// Quantity at the best bid.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub bid_qty: Decimal,
    /// Best ask price.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub ask_price: Decimal,
    /// Quantity at the best ask.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub ask_qty: Decimal,
    /// Absolute price change over the window.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub price_change: Decimal,
    /// Relative price change over the window, in percent.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub percent_price_change: Decimal,
    /// Quote-asset volume over the window.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub quote_volume: Decimal,
}

impl Quote {
    /// Whether a bid side is present.
    #[must_use]
    pub fn has_bid(&self) -> bool {
        self.bid_price > Decimal::ZERO
    }

    /// Whether an ask side is present.
    #[must_use]
    pub fn has_ask(&self) -> bool {
        self.ask_price > Decimal::ZERO
    }
}

/// Exchange timestamps (Unix epoch milliseconds) and ingestion stamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTime {
    /// Start of the statistics window.
    #[serde(default)]
    pub open_time: i64,
    /// End of the statistics window.
    #[serde(default)]
    pub close_time: i64,
    /// Exchange event time.
    #[serde(default)]
    pub event_time: i64,
    /// Ingestion time as Unix epoch seconds.
    #[serde(default)]
    pub gq_published: String,
}

/// Trade statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    /// First trade ID in the window (or the trade's own ID).
    #[serde(default)]
    pub first_trade_id: i64,
    /// Number of trades in the window.
    #[serde(default)]
    pub num_trades: i64,
    /// Quantity of the last trade.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub last_trade_qty: Decimal,
    /// Volume-weighted average price.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub weighted_avg_price: Decimal,
}

/// Canonical market data envelope, identical in shape for every exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerData {
    /// Record ID (UUID v4).
    #[serde(rename = "_id", default)]
    pub id: String,
    /// Asset class wire name.
    #[serde(default)]
    pub asset_class: String,
    /// Dotted channel name.
    #[serde(default)]
    pub channel: String,
    /// Exchange wire name.
    #[serde(default)]
    pub exchange: String,
    /// Data type wire name.
    #[serde(rename = "type", default)]
    pub data_type: String,
    /// Exchange-native symbol.
    #[serde(default)]
    pub symbol: String,
    /// Price bar.
    #[serde(default)]
    pub ohlcv: Ohlcv,
    /// Top of book.
    #[serde(default)]
    pub quote: Quote,
    /// Timestamps.
    #[serde(default)]
    pub time: MarketTime,
    /// Trade statistics.
    #[serde(default)]
    pub trade: Trade,
}

// =============================================================================
// Invariants
// =============================================================================

/// A canonical invariant a record failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaViolation {
    /// A price, quantity or volume is negative.
    #[error("{field} is negative: {value}")]
    NegativeValue {
        /// Dotted field name.
        field: &'static str,
        /// Offending value.
        value: Decimal,
    },
    /// A count or identifier is negative.
    #[error("{field} is negative: {value}")]
    NegativeCount {
        /// Dotted field name.
        field: &'static str,
        /// Offending value.
        value: i64,
    },
    /// Low/high do not bound open/close.
    #[error("OHLC out of bounds: open={open} high={high} low={low} close={close}")]
    OhlcBounds {
        /// Open price.
        open: Decimal,
        /// High price.
        high: Decimal,
        /// Low price.
        low: Decimal,
        /// Close price.
        close: Decimal,
    },
    /// Bid above ask with both sides present.
    #[error("crossed quote: bid {bid} > ask {ask}")]
    CrossedQuote {
        /// Bid price.
        bid: Decimal,
        /// Ask price.
        ask: Decimal,
    },
    /// Window opens after it closes.
    #[error("openTime {open_time} after closeTime {close_time}")]
    TimeWindow {
        /// Window start.
        open_time: i64,
        /// Window end.
        close_time: i64,
    },
    /// Event time went backwards for the same symbol.
    #[error("eventTime regressed from {previous} to {current}")]
    EventTimeRegression {
        /// Last accepted event time.
        previous: i64,
        /// Rejected event time.
        current: i64,
    },
    /// Message symbol does not belong to the stream.
    #[error("symbol {actual:?} does not match stream symbol {expected:?}")]
    SymbolMismatch {
        /// Symbol of the stream.
        expected: String,
        /// Symbol carried by the message.
        actual: String,
    },
}

impl TickerData {
    /// Check the per-record invariants.
    ///
    /// Event-time monotonicity spans records and is checked by the
    /// normalizer, not here.
    pub fn validate(&self) -> Result<(), SchemaViolation> {
        let non_negative = [
            ("ohlcv.openPrice", self.ohlcv.open_price),
            ("ohlcv.highPrice", self.ohlcv.high_price),
            ("ohlcv.lowPrice", self.ohlcv.low_price),
            ("ohlcv.closePrice", self.ohlcv.close_price),
            ("ohlcv.volume", self.ohlcv.volume),
            ("quote.bidPrice", self.quote.bid_price),
            ("quote.bidQty", self.quote.bid_qty),
            ("quote.askPrice", self.quote.ask_price),
            ("quote.askQty", self.quote.ask_qty),
            ("quote.quoteVolume", self.quote.quote_volume),
            ("trade.lastTradeQty", self.trade.last_trade_qty),
            ("trade.weightedAvgPrice", self.trade.weighted_avg_price),
        ];
        if let Some((field, value)) = non_negative
            .into_iter()
            .find(|(_, value)| *value < Decimal::ZERO)
        {
            return Err(SchemaViolation::NegativeValue { field, value });
        }

        for (field, value) in [
            ("trade.firstTradeId", self.trade.first_trade_id),
            ("trade.numTrades", self.trade.num_trades),
        ] {
            if value < 0 {
                return Err(SchemaViolation::NegativeCount { field, value });
            }
        }

        let ohlcv = &self.ohlcv;
        let body_low = ohlcv.open_price.min(ohlcv.close_price);
        let body_high = ohlcv.open_price.max(ohlcv.close_price);
        if ohlcv.low_price > body_low || ohlcv.high_price < body_high {
            return Err(SchemaViolation::OhlcBounds {
                open: ohlcv.open_price,
                high: ohlcv.high_price,
                low: ohlcv.low_price,
                close: ohlcv.close_price,
            });
        }

        if self.quote.has_bid() && self.quote.has_ask() && self.quote.bid_price > self.quote.ask_price
        {
            return Err(SchemaViolation::CrossedQuote {
                bid: self.quote.bid_price,
                ask: self.quote.ask_price,
            });
        }

        if self.time.open_time > self.time.close_time {
            return Err(SchemaViolation::TimeWindow {
                open_time: self.time.open_time,
                close_time: self.time.close_time,
            });
        }

        Ok(())
    }
}
