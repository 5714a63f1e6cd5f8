//! Bitfinex WebSocket v2 decoding.
//!
//! Market data arrives as positional arrays keyed by channel ID; the symbol
//! only appears in the `subscribed` event that binds the ID.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {"event":"subscribed","channel":"ticker","chanId":224555,"symbol":"tBTCUSD","pair":"BTCUSD"}
//! [224555,[26930,10.5,26931,8.2,310,0.0117,26930.5,1402.9,27020,26490]]
//! [17082,"te",[401597395,1574694478808,0.005,7245.3]]
//! [17091,[[7254.7,1,0.5],[7254.8,2,-1.2]]]
//! [17091,"hb"]
//! ```
//!
//! Ticker fields: `BID, BID_SIZE, ASK, ASK_SIZE, DAILY_CHANGE,
//! DAILY_CHANGE_RELATIVE, LAST_PRICE, VOLUME, HIGH, LOW`. Book levels:
//! `PRICE, COUNT, AMOUNT` (positive amount bids, negative asks, zero count
//! removes). Trades: `ID, MTS, AMOUNT, PRICE` (negative amount is a sell).

use rust_decimal::Decimal;
use serde_json::Value;

use super::book::BookMessage;
use super::codec::{self, Fill};
use super::{Decoded, MarketUpdate, NormalizeError, expect_data_type, tag};
use crate::domain::registry::DataType;
use crate::domain::streaming::{Ohlcv, Quote};

const TICKER_FIELDS: usize = 10;

/// Decode one Bitfinex message for a stream of `data_type`.
pub(super) fn decode(data_type: DataType, value: &Value) -> Result<Decoded, NormalizeError> {
    match value {
        Value::Object(_) => event(value),
        Value::Array(items) => {
            let [chan_id, payload, rest @ ..] = items.as_slice() else {
                return Err(NormalizeError::invalid("channel message shorter than 2 items"));
            };
            let channel_id = codec::integer(chan_id, "chanId")?;

            let decoded = match payload {
                Value::String(code) => match code.as_str() {
                    "hb" => return Err(NormalizeError::control("heartbeat")),
                    "cs" => return Err(NormalizeError::control("checksum")),
                    // Repeats an already delivered "te" with final details
                    "tu" | "fte" | "ftu" => {
                        return Err(NormalizeError::control(format!("{code} repeat")));
                    }
                    "te" => {
                        expect_data_type(DataType::Trade, data_type, "te")?;
                        let fill = rest
                            .first()
                            .ok_or_else(|| NormalizeError::invalid("trade event without fields"))?;
                        let update = codec::aggregate_fills(None, &[fill_from(fill)?])?;
                        Decoded::Update(Box::new(update))
                    }
                    other => return Err(NormalizeError::UnexpectedType(other.to_string())),
                },
                Value::Array(fields) => channel_payload(data_type, fields)?,
                other => {
                    return Err(NormalizeError::invalid(format!(
                        "unexpected channel payload {other}"
                    )));
                }
            };

            Ok(on_channel(decoded, channel_id))
        }
        _ => Err(NormalizeError::invalid("expected array or event object")),
    }
}

fn event(value: &Value) -> Result<Decoded, NormalizeError> {
    match tag(value, "event") {
        Some("subscribed") => {
            let channel_id = value
                .get("chanId")
                .map(|id| codec::integer(id, "chanId"))
                .transpose()?
                .ok_or_else(|| NormalizeError::invalid("subscribed event without chanId"))?;
            let symbol = tag(value, "symbol")
                .or_else(|| tag(value, "pair"))
                .ok_or_else(|| NormalizeError::invalid("subscribed event without symbol"))?;
            Ok(Decoded::Subscribed {
                channel_id,
                symbol: symbol.to_string(),
            })
        }
        Some(other) => Err(NormalizeError::control(format!("{other} event"))),
        None => Err(NormalizeError::invalid("object without event")),
    }
}

/// Attach the channel ID that resolves the symbol.
fn on_channel(mut decoded: Decoded, channel_id: i64) -> Decoded {
    match &mut decoded {
        Decoded::Update(update) => update.channel_id = Some(channel_id),
        Decoded::Book(message) => message.channel_id = Some(channel_id),
        Decoded::Subscribed { .. } => {}
    }
    decoded
}

fn channel_payload(data_type: DataType, fields: &[Value]) -> Result<Decoded, NormalizeError> {
    if fields.is_empty() {
        return Err(NormalizeError::control("empty snapshot"));
    }
    let nested = fields.iter().all(Value::is_array);

    let update = match (data_type, nested) {
        (DataType::Ticker, false) => ticker(fields)?,
        (DataType::Book, true) => {
            let levels = fields
                .iter()
                .filter_map(|level| level.as_array().map(Vec::as_slice));
            return book(levels, true);
        }
        (DataType::Book, false) => return book([fields], false),
        (DataType::Trade, true) => {
            let mut fills = fields.iter().map(fill_from).collect::<Result<Vec<_>, _>>()?;
            // Snapshots list the newest trade first
            fills.sort_by_key(|fill| fill.time);
            codec::aggregate_fills(None, &fills)?
        }
        _ => {
            return Err(NormalizeError::invalid(format!(
                "payload shape does not match {data_type} stream"
            )));
        }
    };
    Ok(Decoded::Update(Box::new(update)))
}

fn ticker(fields: &[Value]) -> Result<MarketUpdate, NormalizeError> {
    if fields.len() < TICKER_FIELDS {
        return Err(NormalizeError::invalid(format!(
            "ticker has {} fields, expected {TICKER_FIELDS}",
            fields.len()
        )));
    }
    let field = |index: usize, name: &str| codec::decimal(&fields[index], name);

    let change = field(4, "DAILY_CHANGE")?;
    let change_relative = field(5, "DAILY_CHANGE_RELATIVE")?;
    let last = field(6, "LAST_PRICE")?;
    let open_price = last
        .checked_sub(change)
        .ok_or_else(|| NormalizeError::invalid("open price overflows"))?;

    Ok(MarketUpdate {
        ohlcv: Ohlcv {
            open_price,
            high_price: field(8, "HIGH")?,
            low_price: field(9, "LOW")?,
            close_price: last,
            volume: field(7, "VOLUME")?,
        },
        quote: Quote {
            bid_price: field(0, "BID")?,
            bid_qty: field(1, "BID_SIZE")?,
            ask_price: field(2, "ASK")?,
            ask_qty: field(3, "ASK_SIZE")?,
            price_change: change,
            percent_price_change: change_relative
                .checked_mul(Decimal::ONE_HUNDRED)
                .unwrap_or_default(),
            quote_volume: Decimal::ZERO,
        },
        ..MarketUpdate::default()
    })
}

fn book<'a>(
    levels: impl IntoIterator<Item = &'a [Value]>,
    snapshot: bool,
) -> Result<Decoded, NormalizeError> {
    let mut bids = Vec::new();
    let mut asks = Vec::new();

    for level in levels {
        let [price, count, amount, ..] = level else {
            return Err(NormalizeError::invalid("book level is not [PRICE, COUNT, AMOUNT]"));
        };
        let price = codec::decimal(price, "PRICE")?;
        let count = codec::integer(count, "COUNT")?;
        let amount = codec::decimal(amount, "AMOUNT")?;
        let qty = if count == 0 { Decimal::ZERO } else { amount.abs() };

        if amount.is_sign_negative() {
            asks.push((price, qty));
        } else {
            bids.push((price, qty));
        }
    }

    Ok(Decoded::Book(Box::new(BookMessage {
        snapshot,
        bids,
        asks,
        ..BookMessage::default()
    })))
}

fn fill_from(value: &Value) -> Result<Fill, NormalizeError> {
    let Some([id, mts, amount, price, ..]) = value.as_array().map(Vec::as_slice) else {
        return Err(NormalizeError::invalid("trade is not [ID, MTS, AMOUNT, PRICE]"));
    };

    Ok(Fill {
        id: codec::integer(id, "ID")?,
        price: codec::decimal(price, "PRICE")?,
        qty: codec::decimal(amount, "AMOUNT")?.abs(),
        time: Some(codec::integer(mts, "MTS")?),
    })
}
