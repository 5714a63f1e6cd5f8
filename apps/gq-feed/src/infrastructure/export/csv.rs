//! CSV Export
//!
//! One row per [`TickerData`], nested fields flattened under dotted headers:
//!
//! ```text
//! _id,assetClass,channel,exchange,type,symbol,ohlcv.openPrice,…,trade.weightedAvgPrice
//! ```
//!
//! Opening an existing non-empty file appends rows without repeating the
//! header.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::TickerData;

/// CSV export failures.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The output file could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        /// Output path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Writing a row failed.
    #[error("failed to write CSV row: {0}")]
    Csv(#[from] ::csv::Error),

    /// Flushing the writer failed.
    #[error("failed to flush CSV output: {0}")]
    Io(#[from] io::Error),
}

/// Flattened row layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvRecord {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "assetClass")]
    asset_class: String,
    channel: String,
    exchange: String,
    #[serde(rename = "type")]
    data_type: String,
    symbol: String,
    #[serde(rename = "ohlcv.openPrice")]
    open_price: Decimal,
    #[serde(rename = "ohlcv.highPrice")]
    high_price: Decimal,
    #[serde(rename = "ohlcv.lowPrice")]
    low_price: Decimal,
    #[serde(rename = "ohlcv.closePrice")]
    close_price: Decimal,
    #[serde(rename = "ohlcv.volume")]
    volume: Decimal,
    #[serde(rename = "quote.bidPrice")]
    bid_price: Decimal,
    #[serde(rename = "quote.bidQty")]
    bid_qty: Decimal,
    #[serde(rename = "quote.askPrice")]
    ask_price: Decimal,
    #[serde(rename = "quote.askQty")]
    ask_qty: Decimal,
    #[serde(rename = "quote.priceChange")]
    price_change: Decimal,
    #[serde(rename = "quote.percentPriceChange")]
    percent_price_change: Decimal,
    #[serde(rename = "quote.quoteVolume")]
    quote_volume: Decimal,
    #[serde(rename = "time.openTime")]
    open_time: i64,
    #[serde(rename = "time.closeTime")]
    close_time: i64,
    #[serde(rename = "time.eventTime")]
    event_time: i64,
    #[serde(rename = "time.gqPublished")]
    gq_published: String,
    #[serde(rename = "trade.firstTradeId")]
    first_trade_id: i64,
    #[serde(rename = "trade.numTrades")]
    num_trades: i64,
    #[serde(rename = "trade.lastTradeQty")]
    last_trade_qty: Decimal,
    #[serde(rename = "trade.weightedAvgPrice")]
    weighted_avg_price: Decimal,
}

impl From<&TickerData> for CsvRecord {
    fn from(record: &TickerData) -> Self {
        Self {
            id: record.id.clone(),
            asset_class: record.asset_class.clone(),
            channel: record.channel.clone(),
            exchange: record.exchange.clone(),
            data_type: record.data_type.clone(),
            symbol: record.symbol.clone(),
            open_price: record.ohlcv.open_price,
            high_price: record.ohlcv.high_price,
            low_price: record.ohlcv.low_price,
            close_price: record.ohlcv.close_price,
            volume: record.ohlcv.volume,
            bid_price: record.quote.bid_price,
            bid_qty: record.quote.bid_qty,
            ask_price: record.quote.ask_price,
            ask_qty: record.quote.ask_qty,
            price_change: record.quote.price_change,
            percent_price_change: record.quote.percent_price_change,
            quote_volume: record.quote.quote_volume,
            open_time: record.time.open_time,
            close_time: record.time.close_time,
            event_time: record.time.event_time,
            gq_published: record.time.gq_published.clone(),
            first_trade_id: record.trade.first_trade_id,
            num_trades: record.trade.num_trades,
            last_trade_qty: record.trade.last_trade_qty,
            weighted_avg_price: record.trade.weighted_avg_price,
        }
    }
}

/// Writes canonical records as CSV rows.
#[derive(Debug)]
pub struct CsvExporter<W: Write> {
    writer: ::csv::Writer<W>,
    rows: u64,
}

impl CsvExporter<File> {
    /// Open `path` for appending, writing the header only to a new or empty
    /// file.
    ///
    /// # Errors
    ///
    /// [`ExportError::Open`] when the file cannot be opened.
    pub fn append(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let path = path.as_ref();
        let open_error = |source| ExportError::Open {
            path: path.display().to_string(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(open_error)?;
        let is_empty = file.metadata().map_err(open_error)?.len() == 0;

        Ok(Self::from_writer(file, is_empty))
    }
}

impl<W: Write> CsvExporter<W> {
    /// Wrap any writer.
    pub fn from_writer(writer: W, write_header: bool) -> Self {
        Self {
            writer: ::csv::WriterBuilder::new()
                .has_headers(write_header)
                .from_writer(writer),
            rows: 0,
        }
    }

    /// Append one record.
    ///
    /// # Errors
    ///
    /// [`ExportError::Csv`] on serialization or I/O failure.
    pub fn write(&mut self, record: &TickerData) -> Result<(), ExportError> {
        self.writer.serialize(CsvRecord::from(record))?;
        self.rows += 1;
        Ok(())
    }

    /// Flush buffered rows.
    ///
    /// # Errors
    ///
    /// [`ExportError::Io`] when the underlying writer fails.
    pub fn flush(&mut self) -> Result<(), ExportError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Rows written by this exporter.
    #[must_use]
    pub const fn rows(&self) -> u64 {
        self.rows
    }
}
