//! Binance spot stream decoding.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {"e":"24hrTicker","E":1672515782136,"s":"BNBBTC","p":"0.0015","P":"250.00","w":"0.0018","c":"0.0025","Q":"10","b":"0.0024","B":"10","a":"0.0026","A":"100","o":"0.0010","h":"0.0025","l":"0.0010","v":"10000","q":"18","O":0,"C":86400000,"F":0,"L":18150,"n":18151}
//! {"e":"trade","E":1672515782136,"s":"BNBBTC","t":12345,"p":"0.001","q":"100","T":1672515782136,"m":true,"M":true}
//! {"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}
//! ```
//!
//! Combined streams wrap each payload as `{"stream": "...", "data": {...}}`.
//! Numeric fields arrive as decimal strings.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use super::codec::{self, Fill};
use super::{Decoded, MarketUpdate, NormalizeError, expect_data_type, tag};
use crate::domain::registry::DataType;
use crate::domain::streaming::{Ohlcv, Quote, Trade};

/// Rolling 24h ticker statistics.
#[derive(Debug, Deserialize)]
struct TickerMessage {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price_change: Decimal,
    #[serde(rename = "P")]
    price_change_percent: Decimal,
    #[serde(rename = "w")]
    weighted_avg_price: Decimal,
    #[serde(rename = "c")]
    last_price: Decimal,
    #[serde(rename = "Q")]
    last_qty: Decimal,
    #[serde(rename = "b")]
    bid_price: Decimal,
    #[serde(rename = "B")]
    bid_qty: Decimal,
    #[serde(rename = "a")]
    ask_price: Decimal,
    #[serde(rename = "A")]
    ask_qty: Decimal,
    #[serde(rename = "o")]
    open_price: Decimal,
    #[serde(rename = "h")]
    high_price: Decimal,
    #[serde(rename = "l")]
    low_price: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "q")]
    quote_volume: Decimal,
    #[serde(rename = "O")]
    open_time: i64,
    #[serde(rename = "C")]
    close_time: i64,
    #[serde(rename = "F")]
    first_trade_id: i64,
    #[serde(rename = "n")]
    num_trades: i64,
}

/// Single trade.
#[derive(Debug, Deserialize)]
struct TradeMessage {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "t")]
    trade_id: i64,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    qty: Decimal,
    #[serde(rename = "T")]
    trade_time: i64,
}

/// Best bid/ask update.
#[derive(Debug, Deserialize)]
struct BookTickerMessage {
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bid_price: Decimal,
    #[serde(rename = "B")]
    bid_qty: Decimal,
    #[serde(rename = "a")]
    ask_price: Decimal,
    #[serde(rename = "A")]
    ask_qty: Decimal,
}

/// Decode one Binance message for a stream of `data_type`.
pub(super) fn decode(data_type: DataType, value: Value) -> Result<Decoded, NormalizeError> {
    let value = unwrap_combined(value);

    if !value.is_object() {
        return Err(NormalizeError::invalid("expected a JSON object"));
    }
    if value.get("result").is_some() && value.get("id").is_some() {
        return Err(NormalizeError::control("subscription response"));
    }
    if let Some(msg) = value.get("msg").and_then(Value::as_str) {
        return Err(NormalizeError::control(format!("exchange message: {msg}")));
    }

    let update = match tag(&value, "e") {
        Some("24hrTicker") => {
            expect_data_type(DataType::Ticker, data_type, "24hrTicker")?;
            ticker(serde_json::from_value(value)?)
        }
        Some("trade") => {
            expect_data_type(DataType::Trade, data_type, "trade")?;
            trade(serde_json::from_value(value)?)?
        }
        Some("bookTicker") => {
            expect_data_type(DataType::Book, data_type, "bookTicker")?;
            book_ticker(serde_json::from_value(value)?)?
        }
        Some(other) => return Err(NormalizeError::UnexpectedType(other.to_string())),
        None if value.get("u").is_some() => {
            expect_data_type(DataType::Book, data_type, "bookTicker")?;
            book_ticker(serde_json::from_value(value)?)?
        }
        None => return Err(NormalizeError::invalid("missing event type")),
    };

    Ok(Decoded::Update(Box::new(update)))
}

fn unwrap_combined(mut value: Value) -> Value {
    if value.get("stream").is_some()
        && let Some(data) = value.get_mut("data")
    {
        return data.take();
    }
    value
}

fn ticker(msg: TickerMessage) -> MarketUpdate {
    // F is -1 when the window holds no trades
    let first_trade_id = if msg.num_trades == 0 && msg.first_trade_id < 0 {
        0
    } else {
        msg.first_trade_id
    };

    MarketUpdate {
        symbol: Some(msg.symbol),
        ohlcv: Ohlcv {
            open_price: msg.open_price,
            high_price: msg.high_price,
            low_price: msg.low_price,
            close_price: msg.last_price,
            volume: msg.volume,
        },
        quote: Quote {
            bid_price: msg.bid_price,
            bid_qty: msg.bid_qty,
            ask_price: msg.ask_price,
            ask_qty: msg.ask_qty,
            price_change: msg.price_change,
            percent_price_change: msg.price_change_percent,
            quote_volume: msg.quote_volume,
        },
        trade: Trade {
            first_trade_id,
            num_trades: msg.num_trades,
            last_trade_qty: msg.last_qty,
            weighted_avg_price: msg.weighted_avg_price,
        },
        open_time: msg.open_time,
        close_time: msg.close_time,
        event_time: Some(msg.event_time),
        ..MarketUpdate::default()
    }
}

fn trade(msg: TradeMessage) -> Result<MarketUpdate, NormalizeError> {
    let mut update = codec::aggregate_fills(
        Some(msg.symbol),
        &[Fill {
            id: msg.trade_id,
            price: msg.price,
            qty: msg.qty,
            time: Some(msg.trade_time),
        }],
    )?;
    update.event_time = Some(msg.event_time);
    Ok(update)
}

fn book_ticker(msg: BookTickerMessage) -> Result<MarketUpdate, NormalizeError> {
    let quote = codec::top_of_book(
        [(msg.bid_price, msg.bid_qty)],
        [(msg.ask_price, msg.ask_qty)],
    );
    codec::book_update(Some(msg.symbol), quote, msg.event_time)
}
