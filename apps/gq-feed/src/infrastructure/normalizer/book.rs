//! Resting price levels of one descriptor's order book.
//!
//! Snapshot messages replace the book; delta messages amend single levels,
//! with a zero quantity removing the level. Top of book is always read from
//! the full level set, never from the levels of the last message alone.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use super::NormalizeError;
use crate::domain::streaming::Quote;

/// Level changes carried by one book message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BookMessage {
    /// Symbol carried by the message, if any.
    pub symbol: Option<String>,
    /// Exchange channel ID, for encodings that omit the symbol.
    pub channel_id: Option<i64>,
    /// Replaces the whole book instead of amending it.
    pub snapshot: bool,
    /// `(price, quantity)` bid levels.
    pub bids: Vec<(Decimal, Decimal)>,
    /// `(price, quantity)` ask levels.
    pub asks: Vec<(Decimal, Decimal)>,
    /// Exchange event time, if the message has one.
    pub event_time: Option<i64>,
}

impl BookMessage {
    /// Reject negative prices or quantities before they reach the book.
    pub(crate) fn check_levels(&self) -> Result<(), NormalizeError> {
        let negative = self
            .bids
            .iter()
            .chain(&self.asks)
            .find(|(price, qty)| *price < Decimal::ZERO || *qty < Decimal::ZERO);
        match negative {
            Some((price, qty)) => Err(NormalizeError::invalid(format!(
                "negative book level {price} x {qty}"
            ))),
            None => Ok(()),
        }
    }
}

/// Price-ordered bid and ask levels.
#[derive(Debug, Default)]
pub(crate) struct OrderBook {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl OrderBook {
    /// Apply one message's levels.
    pub(crate) fn apply(&mut self, message: &BookMessage) {
        if message.snapshot {
            self.bids.clear();
            self.asks.clear();
        }
        apply_side(&mut self.bids, &message.bids);
        apply_side(&mut self.asks, &message.asks);
    }

    /// Highest bid and lowest ask; an empty side stays zeroed.
    pub(crate) fn top(&self) -> Quote {
        let (bid_price, bid_qty) = self
            .bids
            .last_key_value()
            .map(|(price, qty)| (*price, *qty))
            .unwrap_or_default();
        let (ask_price, ask_qty) = self
            .asks
            .first_key_value()
            .map(|(price, qty)| (*price, *qty))
            .unwrap_or_default();
        Quote {
            bid_price,
            bid_qty,
            ask_price,
            ask_qty,
            ..Quote::default()
        }
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}

fn apply_side(side: &mut BTreeMap<Decimal, Decimal>, levels: &[(Decimal, Decimal)]) {
    for &(price, qty) in levels {
        if qty.is_zero() {
            side.remove(&price);
        } else {
            side.insert(price, qty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn message(
        snapshot: bool,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
    ) -> BookMessage {
        BookMessage {
            snapshot,
            bids: bids.to_vec(),
            asks: asks.to_vec(),
            ..BookMessage::default()
        }
    }

    #[test]
    fn delta_below_best_keeps_top() {
        let mut book = OrderBook::default();
        book.apply(&message(
            true,
            &[(dec!(100), dec!(1)), (dec!(99), dec!(2))],
            &[(dec!(101), dec!(1))],
        ));
        book.apply(&message(false, &[(dec!(98), dec!(5))], &[]));

        let top = book.top();
        assert_eq!(top.bid_price, dec!(100));
        assert_eq!(top.bid_qty, dec!(1));
        assert_eq!(top.ask_price, dec!(101));
        assert_eq!(book.depth(), (3, 1));
    }

    #[test]
    fn removing_best_level_falls_back_to_next() {
        let mut book = OrderBook::default();
        book.apply(&message(
            true,
            &[(dec!(100), dec!(1)), (dec!(99), dec!(2))],
            &[(dec!(101), dec!(1)), (dec!(102), dec!(4))],
        ));
        book.apply(&message(
            false,
            &[(dec!(100.00), Decimal::ZERO)],
            &[(dec!(101), Decimal::ZERO)],
        ));

        let top = book.top();
        assert_eq!(top.bid_price, dec!(99));
        assert_eq!(top.bid_qty, dec!(2));
        assert_eq!(top.ask_price, dec!(102));
        assert_eq!(top.ask_qty, dec!(4));
    }

    #[test]
    fn snapshot_replaces_levels() {
        let mut book = OrderBook::default();
        book.apply(&message(true, &[(dec!(100), dec!(1))], &[(dec!(101), dec!(1))]));
        book.apply(&message(true, &[(dec!(90), dec!(3))], &[]));

        let top = book.top();
        assert_eq!(top.bid_price, dec!(90));
        assert!(!top.has_ask());
        assert_eq!(book.depth(), (1, 0));
    }

    #[test]
    fn negative_level_is_rejected() {
        let msg = message(false, &[(dec!(100), dec!(-1))], &[]);
        assert!(matches!(
            msg.check_levels(),
            Err(NormalizeError::InvalidFormat(_))
        ));
    }
}
