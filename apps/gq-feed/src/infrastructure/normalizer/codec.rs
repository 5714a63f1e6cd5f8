//! Normalizer Codec Helpers
//!
//! JSON framing, decimal and timestamp decoding, and the reductions shared by
//! the exchange decoders (trade aggregation, top of book).

use std::str::FromStr;

use chrono::DateTime;
use rust_decimal::Decimal;
use serde_json::Value;

use super::{MarketUpdate, NormalizeError};
use crate::domain::streaming::{Ohlcv, Quote, Trade};

/// Parse a raw text message as a JSON object or array.
///
/// # Errors
///
/// Returns an error if the text is not JSON, or is a JSON scalar.
pub(super) fn parse_json(raw: &str) -> Result<Value, NormalizeError> {
    let trimmed = raw.trim();

    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        let preview: String = trimmed.chars().take(50).collect();
        return Err(NormalizeError::invalid(format!(
            "expected JSON array or object, got: {preview}..."
        )));
    }

    Ok(serde_json::from_str(trimmed)?)
}

/// Decode a decimal from a JSON string or number.
pub(super) fn decimal(value: &Value, field: &str) -> Result<Decimal, NormalizeError> {
    match value {
        Value::String(s) => parse_decimal(s, field),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Decimal::from(i))
            } else if let Some(u) = n.as_u64() {
                Ok(Decimal::from(u))
            } else {
                parse_decimal(&n.to_string(), field)
            }
        }
        Value::Null => Ok(Decimal::ZERO),
        other => Err(NormalizeError::invalid(format!(
            "{field}: expected number, got {other}"
        ))),
    }
}

fn parse_decimal(s: &str, field: &str) -> Result<Decimal, NormalizeError> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|e| NormalizeError::invalid(format!("{field}: {s:?} is not a decimal: {e}")))
}

/// Decode an integer from a JSON number.
pub(super) fn integer(value: &Value, field: &str) -> Result<i64, NormalizeError> {
    value
        .as_i64()
        .ok_or_else(|| NormalizeError::invalid(format!("{field}: expected integer, got {value}")))
}

/// Convert an RFC 3339 timestamp to Unix epoch milliseconds.
pub(super) fn rfc3339_millis(s: &str) -> Result<i64, NormalizeError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| NormalizeError::invalid(format!("timestamp {s:?}: {e}")))
}

// =============================================================================
// Reductions
// =============================================================================

/// One executed trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Fill {
    pub id: i64,
    pub price: Decimal,
    pub qty: Decimal,
    pub time: Option<i64>,
}

/// Fold the trades of one message into a single update.
///
/// One trade gives a point bar; several give the bar spanning them with the
/// volume-weighted average price.
pub(super) fn aggregate_fills(
    symbol: Option<String>,
    fills: &[Fill],
) -> Result<MarketUpdate, NormalizeError> {
    let (Some(first), Some(last)) = (fills.first(), fills.last()) else {
        return Err(NormalizeError::control("empty trade batch"));
    };

    let mut ohlcv = Ohlcv::point(first.price, Decimal::ZERO);
    let mut notional = Decimal::ZERO;
    for fill in fills {
        ohlcv.high_price = ohlcv.high_price.max(fill.price);
        ohlcv.low_price = ohlcv.low_price.min(fill.price);
        ohlcv.volume = ohlcv
            .volume
            .checked_add(fill.qty)
            .ok_or_else(|| NormalizeError::invalid("trade volume overflow"))?;
        notional = fill
            .price
            .checked_mul(fill.qty)
            .and_then(|value| notional.checked_add(value))
            .ok_or_else(|| NormalizeError::invalid("trade notional overflow"))?;
    }
    ohlcv.close_price = last.price;

    let weighted_avg_price = if ohlcv.volume.is_zero() {
        last.price
    } else {
        notional
            .checked_div(ohlcv.volume)
            .map_or(last.price, |avg| avg.round_dp(8))
    };

    let times: Vec<i64> = fills.iter().filter_map(|fill| fill.time).collect();
    let open_time = times.iter().copied().min().unwrap_or_default();
    let close_time = times.iter().copied().max().unwrap_or_default();

    Ok(MarketUpdate {
        symbol,
        ohlcv,
        trade: Trade {
            first_trade_id: first.id,
            num_trades: i64::try_from(fills.len()).unwrap_or(i64::MAX),
            last_trade_qty: last.qty,
            weighted_avg_price,
        },
        open_time,
        close_time,
        event_time: times.last().copied(),
        ..MarketUpdate::default()
    })
}

/// Best bid (highest price) and best ask (lowest price) of the resting
/// levels. Levels with zero quantity are removals and ignored.
pub(super) fn top_of_book(
    bids: impl IntoIterator<Item = (Decimal, Decimal)>,
    asks: impl IntoIterator<Item = (Decimal, Decimal)>,
) -> Quote {
    let best_bid = bids
        .into_iter()
        .filter(|(_, qty)| !qty.is_zero())
        .max_by(|a, b| a.0.cmp(&b.0));
    let best_ask = asks
        .into_iter()
        .filter(|(_, qty)| !qty.is_zero())
        .min_by(|a, b| a.0.cmp(&b.0));

    let (bid_price, bid_qty) = best_bid.unwrap_or_default();
    let (ask_price, ask_qty) = best_ask.unwrap_or_default();
    Quote {
        bid_price,
        bid_qty,
        ask_price,
        ask_qty,
        ..Quote::default()
    }
}

/// Turn a top-of-book quote into an update, or a control frame when the
/// message left no resting level on either side.
pub(super) fn book_update(
    symbol: Option<String>,
    quote: Quote,
    event_time: Option<i64>,
) -> Result<MarketUpdate, NormalizeError> {
    if !quote.has_bid() && !quote.has_ask() {
        return Err(NormalizeError::control("book message without resting levels"));
    }
    Ok(MarketUpdate {
        symbol,
        quote,
        event_time,
        ..MarketUpdate::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(json!("0.00100000"), dec!(0.001) ; "decimal string")]
    #[test_case(json!(42), dec!(42) ; "integer")]
    #[test_case(json!(0.5147), dec!(0.5147) ; "float")]
    #[test_case(json!("1.5e-3"), dec!(0.0015) ; "scientific string")]
    #[test_case(json!(null), Decimal::ZERO ; "null")]
    fn decimal_accepts(value: Value, expected: Decimal) {
        assert_eq!(decimal(&value, "p").unwrap(), expected);
    }

    #[test]
    fn decimal_rejects_garbage() {
        assert!(decimal(&json!("abc"), "p").is_err());
        assert!(decimal(&json!([1]), "p").is_err());
    }

    #[test]
    fn parse_json_rejects_scalars() {
        assert!(parse_json("42").is_err());
        assert!(parse_json("").is_err());
        assert!(parse_json("  {\"a\":1}  ").is_ok());
        assert!(matches!(
            parse_json("{broken"),
            Err(NormalizeError::Json(_))
        ));
    }

    #[test]
    fn rfc3339_to_millis() {
        assert_eq!(
            rfc3339_millis("2023-03-08T22:19:17.123456Z").unwrap(),
            1_678_313_957_123
        );
        assert!(rfc3339_millis("yesterday").is_err());
    }

    #[test]
    fn single_fill_is_point_bar() {
        let update = aggregate_fills(
            Some("BTC-USD".to_string()),
            &[Fill {
                id: 7,
                price: dec!(400.23),
                qty: dec!(0.5),
                time: Some(1000),
            }],
        )
        .unwrap();

        assert_eq!(update.ohlcv, Ohlcv::point(dec!(400.23), dec!(0.5)));
        assert_eq!(update.trade.first_trade_id, 7);
        assert_eq!(update.trade.num_trades, 1);
        assert_eq!(update.trade.last_trade_qty, dec!(0.5));
        assert_eq!(update.trade.weighted_avg_price, dec!(400.23));
        assert_eq!(update.event_time, Some(1000));
        assert_eq!((update.open_time, update.close_time), (1000, 1000));
    }

    #[test]
    fn several_fills_span_the_batch() {
        let update = aggregate_fills(
            None,
            &[
                Fill {
                    id: 1,
                    price: dec!(10),
                    qty: dec!(1),
                    time: Some(1),
                },
                Fill {
                    id: 2,
                    price: dec!(12),
                    qty: dec!(1),
                    time: Some(2),
                },
                Fill {
                    id: 3,
                    price: dec!(9),
                    qty: dec!(2),
                    time: Some(3),
                },
            ],
        )
        .unwrap();

        assert_eq!(update.ohlcv.open_price, dec!(10));
        assert_eq!(update.ohlcv.high_price, dec!(12));
        assert_eq!(update.ohlcv.low_price, dec!(9));
        assert_eq!(update.ohlcv.close_price, dec!(9));
        assert_eq!(update.ohlcv.volume, dec!(4));
        assert_eq!(update.trade.num_trades, 3);
        assert_eq!(update.trade.weighted_avg_price, dec!(10));
        assert_eq!(update.trade.last_trade_qty, dec!(2));
    }

    #[test]
    fn empty_batch_is_control() {
        assert_eq!(
            aggregate_fills(None, &[]).unwrap_err().kind(),
            super::super::NormalizeErrorKind::Control
        );
    }

    #[test]
    fn top_of_book_picks_best_levels() {
        let quote = top_of_book(
            [(dec!(99), dec!(1)), (dec!(100), dec!(2)), (dec!(101), dec!(0))],
            [(dec!(103), dec!(1)), (dec!(102), dec!(3))],
        );
        assert_eq!(quote.bid_price, dec!(100));
        assert_eq!(quote.bid_qty, dec!(2));
        assert_eq!(quote.ask_price, dec!(102));
        assert_eq!(quote.ask_qty, dec!(3));
    }

    #[test]
    fn empty_book_is_control() {
        let quote = top_of_book(Vec::new(), [(dec!(5), Decimal::ZERO)]);
        assert!(book_update(None, quote, None).is_err());
    }
}
