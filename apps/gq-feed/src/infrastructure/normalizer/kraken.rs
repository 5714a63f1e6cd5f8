//! Kraken WebSocket v2 decoding.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {"channel":"ticker","type":"update","data":[{"symbol":"BTC/USD","bid":26930.1,"bid_qty":0.5,"ask":26930.2,"ask_qty":1.2,"last":26930.2,"volume":1402.9,"vwap":26811.4,"low":26490.0,"high":27020.0,"change":310.2,"change_pct":1.17}]}
//! {"channel":"trade","type":"update","data":[{"symbol":"MATIC/USD","side":"buy","price":0.5147,"qty":6423.46326,"ord_type":"limit","trade_id":4665846,"timestamp":"2023-09-25T07:48:36.925533Z"}]}
//! {"channel":"book","type":"snapshot","data":[{"symbol":"BTC/USD","bids":[{"price":26930.1,"qty":0.5}],"asks":[{"price":26930.2,"qty":1.2}],"checksum":2439117997}]}
//! ```
//!
//! `heartbeat` and `status` channels and method responses carry no market
//! data.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use super::book::BookMessage;
use super::codec::{self, Fill};
use super::{Decoded, MarketUpdate, NormalizeError, expect_data_type, tag};
use crate::domain::registry::DataType;
use crate::domain::streaming::{Ohlcv, Quote, Trade};

/// Channel envelope.
#[derive(Debug, Deserialize)]
struct ChannelMessage<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    symbol: String,
    bid: Decimal,
    bid_qty: Decimal,
    ask: Decimal,
    ask_qty: Decimal,
    last: Decimal,
    volume: Decimal,
    vwap: Decimal,
    low: Decimal,
    high: Decimal,
    change: Decimal,
    change_pct: Decimal,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TradeEntry {
    symbol: String,
    price: Decimal,
    qty: Decimal,
    trade_id: i64,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct BookLevel {
    price: Decimal,
    qty: Decimal,
}

#[derive(Debug, Deserialize)]
struct BookEntry {
    symbol: String,
    #[serde(default)]
    bids: Vec<BookLevel>,
    #[serde(default)]
    asks: Vec<BookLevel>,
    #[serde(default)]
    timestamp: Option<String>,
}

/// Decode one Kraken message for a stream of `data_type`.
pub(super) fn decode(data_type: DataType, value: Value) -> Result<Decoded, NormalizeError> {
    if let Some(method) = tag(&value, "method") {
        return Err(NormalizeError::control(format!("{method} response")));
    }

    let Some(channel) = tag(&value, "channel") else {
        return Err(NormalizeError::invalid("missing channel"));
    };

    let update = match channel {
        "heartbeat" | "status" => return Err(NormalizeError::control(channel.to_string())),
        "ticker" => {
            expect_data_type(DataType::Ticker, data_type, "ticker")?;
            let msg: ChannelMessage<TickerEntry> = serde_json::from_value(value)?;
            ticker(first(msg.data)?)?
        }
        "trade" => {
            expect_data_type(DataType::Trade, data_type, "trade")?;
            let msg: ChannelMessage<TradeEntry> = serde_json::from_value(value)?;
            trades(msg.data)?
        }
        "book" => {
            expect_data_type(DataType::Book, data_type, "book")?;
            let snapshot = tag(&value, "type") == Some("snapshot");
            let msg: ChannelMessage<BookEntry> = serde_json::from_value(value)?;
            return book(first(msg.data)?, snapshot);
        }
        other => return Err(NormalizeError::UnexpectedType(other.to_string())),
    };

    Ok(Decoded::Update(Box::new(update)))
}

fn first<T>(data: Vec<T>) -> Result<T, NormalizeError> {
    data.into_iter()
        .next()
        .ok_or_else(|| NormalizeError::control("empty data array"))
}

fn ticker(entry: TickerEntry) -> Result<MarketUpdate, NormalizeError> {
    let event_time = entry
        .timestamp
        .as_deref()
        .map(codec::rfc3339_millis)
        .transpose()?;
    let open_price = entry
        .last
        .checked_sub(entry.change)
        .ok_or_else(|| NormalizeError::invalid("open price overflows"))?;

    Ok(MarketUpdate {
        symbol: Some(entry.symbol),
        ohlcv: Ohlcv {
            open_price,
            high_price: entry.high,
            low_price: entry.low,
            close_price: entry.last,
            volume: entry.volume,
        },
        quote: Quote {
            bid_price: entry.bid,
            bid_qty: entry.bid_qty,
            ask_price: entry.ask,
            ask_qty: entry.ask_qty,
            price_change: entry.change,
            percent_price_change: entry.change_pct,
            quote_volume: Decimal::ZERO,
        },
        trade: Trade {
            weighted_avg_price: entry.vwap,
            ..Trade::default()
        },
        event_time,
        ..MarketUpdate::default()
    })
}

fn trades(entries: Vec<TradeEntry>) -> Result<MarketUpdate, NormalizeError> {
    let Some(symbol) = entries.first().map(|entry| entry.symbol.clone()) else {
        return Err(NormalizeError::control("empty data array"));
    };
    if let Some(other) = entries.iter().find(|entry| entry.symbol != symbol) {
        return Err(NormalizeError::invalid(format!(
            "mixed symbols in one trade batch: {symbol} and {}",
            other.symbol
        )));
    }

    let fills = entries
        .into_iter()
        .map(|entry| -> Result<Fill, NormalizeError> {
            Ok(Fill {
                id: entry.trade_id,
                price: entry.price,
                qty: entry.qty,
                time: Some(codec::rfc3339_millis(&entry.timestamp)?),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    codec::aggregate_fills(Some(symbol), &fills)
}

fn book(entry: BookEntry, snapshot: bool) -> Result<Decoded, NormalizeError> {
    let event_time = entry
        .timestamp
        .as_deref()
        .map(codec::rfc3339_millis)
        .transpose()?;

    Ok(Decoded::Book(Box::new(BookMessage {
        symbol: Some(entry.symbol),
        snapshot,
        bids: levels(entry.bids),
        asks: levels(entry.asks),
        event_time,
        ..BookMessage::default()
    })))
}

fn levels(levels: Vec<BookLevel>) -> Vec<(Decimal, Decimal)> {
    levels
        .into_iter()
        .map(|level| (level.price, level.qty))
        .collect()
}
