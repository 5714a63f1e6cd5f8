//! Gateway envelope decoding.
//!
//! The GQ gateway already emits canonical records. Identity fields are
//! re-derived by the normalizer, so only the market fields and the symbol
//! are taken from the message. Identity fields the envelope does carry must
//! match the descriptor it was read on.

use serde::Deserialize;
use serde_json::Value;

use super::NormalizeError;
use crate::domain::registry::ExchangeDescriptor;
use crate::domain::streaming::TickerData;

/// Return the message if it is a gateway envelope.
pub(super) fn detect(value: &Value) -> Option<&Value> {
    let object = value.as_object()?;
    (object.contains_key("ohlcv") || object.contains_key("quote")).then_some(value)
}

/// Decode a gateway envelope read on `descriptor`.
pub(super) fn decode(
    envelope: &Value,
    descriptor: &ExchangeDescriptor,
) -> Result<TickerData, NormalizeError> {
    let record = TickerData::deserialize(envelope)?;

    let identity = [
        ("exchange", &record.exchange, descriptor.exchange().as_str()),
        ("assetClass", &record.asset_class, descriptor.asset_class().as_str()),
        ("type", &record.data_type, descriptor.data_type().as_str()),
    ];
    if let Some((field, actual, _)) = identity
        .iter()
        .find(|(_, actual, expected)| !actual.is_empty() && actual.as_str() != *expected)
    {
        return Err(NormalizeError::UnexpectedType(format!("{field} {actual}")));
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::registry::ExchangeRegistry;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn descriptor(channel: &str) -> ExchangeDescriptor {
        ExchangeRegistry::parse_channel(channel).unwrap()
    }

    #[test]
    fn detects_canonical_objects_only() {
        assert!(detect(&json!({"ohlcv": {}})).is_some());
        assert!(detect(&json!({"quote": {}})).is_some());
        assert!(detect(&json!({"type": "match"})).is_none());
        assert!(detect(&json!([1, "hb"])).is_none());
    }

    #[test]
    fn decodes_sparse_envelope() {
        let envelope = json!({
            "exchange": "binance",
            "type": "ticker",
            "symbol": "BTCUSDT",
            "ohlcv": {"openPrice": 100.0, "highPrice": 110.5, "lowPrice": 95, "closePrice": 101.25},
            "time": {"eventTime": 1678313957000_i64}
        });

        let record = decode(&envelope, &descriptor("binance.spot.ticker.BTCUSDT")).unwrap();
        assert_eq!(record.symbol, "BTCUSDT");
        assert_eq!(record.ohlcv.high_price, dec!(110.5));
        assert_eq!(record.ohlcv.volume, dec!(0));
        assert_eq!(record.time.event_time, 1_678_313_957_000);
    }

    #[test]
    fn rejects_envelope_of_other_data_type() {
        let envelope = json!({"type": "book", "quote": {"bidPrice": 1.0}});
        assert!(matches!(
            decode(&envelope, &descriptor("binance.spot.trade.BTCUSDT")),
            Err(NormalizeError::UnexpectedType(t)) if t == "type book"
        ));
    }

    #[test]
    fn rejects_envelope_of_other_exchange() {
        let envelope = json!({"exchange": "kraken", "type": "trade", "ohlcv": {"closePrice": 1.0}});
        assert!(matches!(
            decode(&envelope, &descriptor("binance.spot.trade.BTCUSDT")),
            Err(NormalizeError::UnexpectedType(t)) if t == "exchange kraken"
        ));
    }

    #[test]
    fn rejects_envelope_of_other_asset_class() {
        let envelope = json!({"assetClass": "futures", "ohlcv": {"closePrice": 1.0}});
        assert!(matches!(
            decode(&envelope, &descriptor("binance.spot.trade.BTCUSDT")),
            Err(NormalizeError::UnexpectedType(t)) if t == "assetClass futures"
        ));
    }

    #[test]
    fn empty_identity_fields_are_accepted() {
        let envelope = json!({"exchange": "", "assetClass": "", "ohlcv": {"closePrice": 1.0}});
        assert!(decode(&envelope, &descriptor("coinbase.spot.trade.BTC-USD")).is_ok());
    }

    #[test]
    fn rejects_non_numeric_prices() {
        let envelope = json!({"ohlcv": {"openPrice": "cheap"}});
        assert!(matches!(
            decode(&envelope, &descriptor("binance.spot.ticker.BTCUSDT")),
            Err(NormalizeError::Json(_))
        ));
    }
}
