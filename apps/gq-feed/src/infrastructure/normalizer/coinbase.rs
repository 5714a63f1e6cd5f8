//! Coinbase Exchange feed decoding.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {"type":"ticker","product_id":"BTC-USD","price":"20153.75","open_24h":"19400.00","volume_24h":"29734.2","low_24h":"19113.09","high_24h":"20259.90","best_bid":"20153.74","best_bid_size":"0.1","best_ask":"20153.75","best_ask_size":"0.3","time":"2022-10-19T23:28:22.061769Z","trade_id":370843401,"last_size":"0.0009"}
//! {"type":"match","trade_id":10,"product_id":"BTC-USD","size":"5.23512","price":"400.23","side":"sell","time":"2014-11-07T08:19:27.028459Z"}
//! {"type":"snapshot","product_id":"BTC-USD","bids":[["10101.10","0.45054140"]],"asks":[["10102.55","0.57753524"]]}
//! {"type":"l2update","product_id":"BTC-USD","time":"2019-08-14T20:42:27.265Z","changes":[["buy","10101.80000000","0.162567"]]}
//! ```

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use super::codec::{self, Fill};
use super::book::BookMessage;
use super::{Decoded, MarketUpdate, NormalizeError, expect_data_type, percent_change, tag};
use crate::domain::registry::DataType;
use crate::domain::streaming::{Ohlcv, Quote, Trade};

const DAY_MS: i64 = 86_400_000;

/// 24h ticker with best bid/ask.
#[derive(Debug, Deserialize)]
struct TickerMessage {
    product_id: String,
    price: Decimal,
    open_24h: Decimal,
    volume_24h: Decimal,
    low_24h: Decimal,
    high_24h: Decimal,
    #[serde(default)]
    best_bid: Decimal,
    #[serde(default)]
    best_bid_size: Decimal,
    #[serde(default)]
    best_ask: Decimal,
    #[serde(default)]
    best_ask_size: Decimal,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    trade_id: i64,
    #[serde(default)]
    last_size: Decimal,
}

/// Executed trade (`match` or `last_match`).
#[derive(Debug, Deserialize)]
struct MatchMessage {
    trade_id: i64,
    product_id: String,
    size: Decimal,
    price: Decimal,
    time: String,
}

/// Full level-2 snapshot.
#[derive(Debug, Deserialize)]
struct SnapshotMessage {
    product_id: String,
    bids: Vec<(Decimal, Decimal)>,
    asks: Vec<(Decimal, Decimal)>,
}

/// Incremental level-2 changes.
#[derive(Debug, Deserialize)]
struct L2UpdateMessage {
    product_id: String,
    time: String,
    changes: Vec<(String, Decimal, Decimal)>,
}

/// Decode one Coinbase message for a stream of `data_type`.
pub(super) fn decode(data_type: DataType, value: Value) -> Result<Decoded, NormalizeError> {
    let Some(message_type) = tag(&value, "type") else {
        return Err(NormalizeError::invalid("missing message type"));
    };

    let update = match message_type {
        "subscriptions" | "heartbeat" | "status" => {
            return Err(NormalizeError::control(message_type.to_string()));
        }
        "error" => {
            let reason = tag(&value, "message").unwrap_or("unknown");
            return Err(NormalizeError::control(format!("exchange error: {reason}")));
        }
        "ticker" => {
            expect_data_type(DataType::Ticker, data_type, "ticker")?;
            ticker(serde_json::from_value(value)?)?
        }
        "match" | "last_match" => {
            expect_data_type(DataType::Trade, data_type, message_type)?;
            trade(serde_json::from_value(value)?)?
        }
        "snapshot" => {
            expect_data_type(DataType::Book, data_type, "snapshot")?;
            return Ok(snapshot(serde_json::from_value(value)?));
        }
        "l2update" => {
            expect_data_type(DataType::Book, data_type, "l2update")?;
            return l2update(serde_json::from_value(value)?);
        }
        other => return Err(NormalizeError::UnexpectedType(other.to_string())),
    };

    Ok(Decoded::Update(Box::new(update)))
}

fn ticker(msg: TickerMessage) -> Result<MarketUpdate, NormalizeError> {
    let event_time = msg.time.as_deref().map(codec::rfc3339_millis).transpose()?;
    let price_change = msg
        .price
        .checked_sub(msg.open_24h)
        .ok_or_else(|| NormalizeError::invalid("24h price change overflows"))?;

    let (open_time, close_time) =
        event_time.map_or((0, 0), |t| (t.saturating_sub(DAY_MS), t));

    Ok(MarketUpdate {
        symbol: Some(msg.product_id),
        ohlcv: Ohlcv {
            open_price: msg.open_24h,
            high_price: msg.high_24h,
            low_price: msg.low_24h,
            close_price: msg.price,
            volume: msg.volume_24h,
        },
        quote: Quote {
            bid_price: msg.best_bid,
            bid_qty: msg.best_bid_size,
            ask_price: msg.best_ask,
            ask_qty: msg.best_ask_size,
            price_change,
            percent_price_change: percent_change(price_change, msg.open_24h),
            quote_volume: Decimal::ZERO,
        },
        trade: Trade {
            first_trade_id: msg.trade_id,
            num_trades: 0,
            last_trade_qty: msg.last_size,
            weighted_avg_price: Decimal::ZERO,
        },
        open_time,
        close_time,
        event_time,
        ..MarketUpdate::default()
    })
}

fn trade(msg: MatchMessage) -> Result<MarketUpdate, NormalizeError> {
    let time = codec::rfc3339_millis(&msg.time)?;
    codec::aggregate_fills(
        Some(msg.product_id),
        &[Fill {
            id: msg.trade_id,
            price: msg.price,
            qty: msg.size,
            time: Some(time),
        }],
    )
}

fn snapshot(msg: SnapshotMessage) -> Decoded {
    Decoded::Book(Box::new(BookMessage {
        symbol: Some(msg.product_id),
        snapshot: true,
        bids: msg.bids,
        asks: msg.asks,
        ..BookMessage::default()
    }))
}

fn l2update(msg: L2UpdateMessage) -> Result<Decoded, NormalizeError> {
    let time = codec::rfc3339_millis(&msg.time)?;

    let mut bids = Vec::new();
    let mut asks = Vec::new();
    for (side, price, size) in msg.changes {
        match side.as_str() {
            "buy" => bids.push((price, size)),
            "sell" => asks.push((price, size)),
            other => {
                return Err(NormalizeError::invalid(format!("unknown book side {other:?}")));
            }
        }
    }

    Ok(Decoded::Book(Box::new(BookMessage {
        symbol: Some(msg.product_id),
        snapshot: false,
        bids,
        asks,
        event_time: Some(time),
        ..BookMessage::default()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use test_case::test_case;

    fn update(decoded: Decoded) -> MarketUpdate {
        match decoded {
            Decoded::Update(update) => *update,
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn decodes_ticker() {
        let raw = json!({
            "type":"ticker","sequence":37475248783_i64,"product_id":"ETH-USD","price":"1285.22",
            "open_24h":"1310.79","volume_24h":"245532.79269678","low_24h":"1280.52",
            "high_24h":"1313.8","volume_30d":"9788783.60117027","best_bid":"1285.04",
            "best_bid_size":"0.46688654","best_ask":"1285.27","best_ask_size":"1.56637040",
            "side":"buy","time":"2022-10-19T23:28:22.061769Z","trade_id":370843401,
            "last_size":"11.4396987"
        });

        let u = update(decode(DataType::Ticker, raw).unwrap());
        assert_eq!(u.symbol.as_deref(), Some("ETH-USD"));
        assert_eq!(u.ohlcv.open_price, dec!(1310.79));
        assert_eq!(u.ohlcv.close_price, dec!(1285.22));
        assert_eq!(u.quote.price_change, dec!(-25.57));
        assert_eq!(u.quote.bid_price, dec!(1285.04));
        assert_eq!(u.trade.last_trade_qty, dec!(11.4396987));
        let event = u.event_time.unwrap();
        assert_eq!(u.close_time, event);
        assert_eq!(u.open_time, event - DAY_MS);
    }

    #[test]
    fn ticker_change_overflow_is_invalid() {
        let raw = json!({
            "type":"ticker","product_id":"BTC-USD","price":"79228162514264337593543950335",
            "open_24h":"-79228162514264337593543950335","volume_24h":"1","low_24h":"1",
            "high_24h":"1","best_bid":"1","best_bid_size":"1","best_ask":"1","best_ask_size":"1",
            "time":"2022-10-19T23:28:22.061769Z","trade_id":1,"last_size":"1"
        });

        assert!(matches!(
            decode(DataType::Ticker, raw),
            Err(NormalizeError::InvalidFormat(_))
        ));
    }

    #[test_case("match" ; "match")]
    #[test_case("last_match" ; "last match")]
    fn decodes_trades(message_type: &str) {
        let raw = json!({
            "type": message_type,"trade_id":10,"sequence":50,"maker_order_id":"ac928c66",
            "taker_order_id":"132fb6ae","time":"2014-11-07T08:19:27.028459Z",
            "product_id":"BTC-USD","size":"5.23512","price":"400.23","side":"sell"
        });

        let u = update(decode(DataType::Trade, raw).unwrap());
        assert_eq!(u.ohlcv, Ohlcv::point(dec!(400.23), dec!(5.23512)));
        assert_eq!(u.trade.first_trade_id, 10);
        assert_eq!(u.event_time, Some(1_415_348_367_028));
    }

    fn book(decoded: Decoded) -> BookMessage {
        match decoded {
            Decoded::Book(message) => *message,
            other => panic!("expected book, got {other:?}"),
        }
    }

    #[test]
    fn decodes_snapshot_levels() {
        let raw = json!({
            "type":"snapshot","product_id":"BTC-USD",
            "bids":[["10101.10","0.45054140"],["10100.00","2"]],
            "asks":[["10102.55","0.57753524"],["10103.00","1"]]
        });

        let b = book(decode(DataType::Book, raw).unwrap());
        assert!(b.snapshot);
        assert_eq!(b.symbol.as_deref(), Some("BTC-USD"));
        assert_eq!(b.bids, vec![(dec!(10101.10), dec!(0.45054140)), (dec!(10100), dec!(2))]);
        assert_eq!(b.asks.len(), 2);
        assert_eq!(b.event_time, None);
    }

    #[test]
    fn decodes_l2update_sides() {
        let raw = json!({
            "type":"l2update","product_id":"BTC-USD","time":"2019-08-14T20:42:27.265Z",
            "changes":[["buy","10101.80000000","0.162567"],["sell","10102.00","0"]]
        });

        let b = book(decode(DataType::Book, raw).unwrap());
        assert!(!b.snapshot);
        assert_eq!(b.bids, vec![(dec!(10101.8), dec!(0.162567))]);
        assert_eq!(b.asks, vec![(dec!(10102), Decimal::ZERO)]);
        assert_eq!(b.event_time, Some(1_565_815_347_265));
    }

    #[test]
    fn l2update_unknown_side_is_invalid() {
        let raw = json!({
            "type":"l2update","product_id":"BTC-USD","time":"2019-08-14T20:42:27.265Z",
            "changes":[["hold","10101.8","1"]]
        });
        assert!(matches!(
            decode(DataType::Book, raw),
            Err(NormalizeError::InvalidFormat(_))
        ));
    }

    #[test_case(json!({"type":"subscriptions","channels":[]}) ; "subscriptions")]
    #[test_case(json!({"type":"heartbeat","sequence":90,"last_trade_id":20,"product_id":"BTC-USD"}) ; "heartbeat")]
    #[test_case(json!({"type":"error","message":"Failed to subscribe"}) ; "error")]
    fn control_frames(raw: Value) {
        assert!(matches!(
            decode(DataType::Trade, raw),
            Err(NormalizeError::Control(_))
        ));
    }

    #[test]
    fn bad_timestamp_is_parse_error() {
        let raw = json!({"type":"match","trade_id":1,"product_id":"BTC-USD","size":"1","price":"1","time":"noon"});
        assert!(matches!(
            decode(DataType::Trade, raw),
            Err(NormalizeError::InvalidFormat(_))
        ));
    }

    #[test]
    fn missing_type_is_parse_error() {
        assert!(matches!(
            decode(DataType::Trade, json!({"price":"1"})),
            Err(NormalizeError::InvalidFormat(_))
        ));
    }
}
