//! Exchange Registry
//!
//! Enumerates the supported exchanges, asset classes and data-feed types and
//! validates a requested stream before any transport call is made.
//!
//! # Matching
//!
//! Matching is exact and case-sensitive against the lowercase wire names
//! (`"coinbase"`, `"spot"`, `"trade"`). There is no fuzzy or partial matching:
//! `"Coinbase"` is an unsupported exchange.
//!
//! # Channel Form
//!
//! A descriptor renders as `exchange.assetClass.dataType.symbol`, the same
//! channel name the gateway subscription uses:
//!
//! ```text
//! coinbase.spot.trade.BTC-USD
//! binance.spot.ticker.BTCUSDT
//! ```

use std::fmt;
use std::str::FromStr;

// =============================================================================
// Enumerations
// =============================================================================

/// Supported exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Exchange {
    /// Coinbase Exchange.
    Coinbase,
    /// Kraken.
    Kraken,
    /// Bitfinex.
    Bitfinex,
    /// Binance.
    Binance,
}

impl Exchange {
    /// All supported exchanges.
    pub const ALL: [Self; 4] = [Self::Coinbase, Self::Kraken, Self::Bitfinex, Self::Binance];

    /// Wire name of the exchange.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Coinbase => "coinbase",
            Self::Kraken => "kraken",
            Self::Bitfinex => "bitfinex",
            Self::Binance => "binance",
        }
    }
}

impl FromStr for Exchange {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|exchange| exchange.as_str() == s)
            .ok_or_else(|| RegistryError::UnsupportedExchange(s.to_string()))
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported asset class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetClass {
    /// Spot markets.
    Spot,
}

impl AssetClass {
    /// All supported asset classes.
    pub const ALL: [Self; 1] = [Self::Spot];

    /// Wire name of the asset class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spot => "spot",
        }
    }
}

impl FromStr for AssetClass {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| RegistryError::UnsupportedAssetClass(s.to_string()))
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported data-feed type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    /// Rolling 24h ticker statistics.
    Ticker,
    /// Order book top of book.
    Book,
    /// Individual trades.
    Trade,
}

impl DataType {
    /// All supported data types.
    pub const ALL: [Self; 3] = [Self::Ticker, Self::Book, Self::Trade];

    /// Wire name of the data type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Book => "book",
            Self::Trade => "trade",
        }
    }
}

impl FromStr for DataType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|data_type| data_type.as_str() == s)
            .ok_or_else(|| RegistryError::UnsupportedDataType(s.to_string()))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Descriptor
// =============================================================================

/// Unvalidated stream request as supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Exchange wire name.
    pub exchange: String,
    /// Asset class wire name.
    pub asset_class: String,
    /// Data type wire name.
    pub data_type: String,
    /// Exchange-native symbol (e.g. `BTC-USD`, `BTCUSDT`).
    pub symbol: String,
}

impl StreamRequest {
    /// Create a new request.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        asset_class: impl Into<String>,
        data_type: impl Into<String>,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            asset_class: asset_class.into(),
            data_type: data_type.into(),
            symbol: symbol.into(),
        }
    }
}

/// Validated identity of one logical stream.
///
/// Immutable once created; used as the key of the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeDescriptor {
    exchange: Exchange,
    asset_class: AssetClass,
    data_type: DataType,
    symbol: String,
}

impl ExchangeDescriptor {
    /// Exchange of the stream.
    #[must_use]
    pub const fn exchange(&self) -> Exchange {
        self.exchange
    }

    /// Asset class of the stream.
    #[must_use]
    pub const fn asset_class(&self) -> AssetClass {
        self.asset_class
    }

    /// Data type of the stream.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Exchange-native symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Dotted channel name (`exchange.assetClass.dataType.symbol`).
    #[must_use]
    pub fn channel(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ExchangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.exchange, self.asset_class, self.data_type, self.symbol
        )
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registry validation errors. All of them are caller configuration errors
/// and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Exchange is not one of the enumerated exchanges.
    #[error("unsupported exchange: {0:?}")]
    UnsupportedExchange(String),
    /// Asset class is not one of the enumerated asset classes.
    #[error("unsupported asset class: {0:?}")]
    UnsupportedAssetClass(String),
    /// Data type is not one of the enumerated data types.
    #[error("unsupported data type: {0:?}")]
    UnsupportedDataType(String),
    /// Symbol is empty or contains whitespace.
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),
    /// Channel string does not have four dot-separated parts.
    #[error("malformed channel: {0:?}")]
    MalformedChannel(String),
}

/// Validates stream requests against the supported exchange matrix.
///
/// # Example
///
/// ```rust
/// use gq_feed::domain::registry::{DataType, Exchange, ExchangeRegistry, StreamRequest};
///
/// let descriptor = ExchangeRegistry::validate(&StreamRequest::new(
///     "coinbase", "spot", "trade", "BTC-USD",
/// ))
/// .unwrap();
/// assert_eq!(descriptor.exchange(), Exchange::Coinbase);
/// assert_eq!(descriptor.data_type(), DataType::Trade);
/// assert_eq!(descriptor.channel(), "coinbase.spot.trade.BTC-USD");
///
/// assert!(ExchangeRegistry::validate(&StreamRequest::new("Coinbase", "spot", "trade", "BTC-USD")).is_err());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ExchangeRegistry;

impl ExchangeRegistry {
    /// Validate a request, producing a typed descriptor.
    ///
    /// Checks run in order exchange, asset class, data type, symbol; the
    /// first failure is reported.
    pub fn validate(request: &StreamRequest) -> Result<ExchangeDescriptor, RegistryError> {
        let exchange = request.exchange.parse::<Exchange>()?;
        let asset_class = request.asset_class.parse::<AssetClass>()?;
        let data_type = request.data_type.parse::<DataType>()?;

        if request.symbol.is_empty() || request.symbol.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidSymbol(request.symbol.clone()));
        }

        Ok(ExchangeDescriptor {
            exchange,
            asset_class,
            data_type,
            symbol: request.symbol.clone(),
        })
    }

    /// Parse and validate a dotted channel such as `kraken.spot.book.BTC/USD`.
    ///
    /// The symbol is everything after the third dot, so symbols may contain
    /// dots themselves.
    pub fn parse_channel(channel: &str) -> Result<ExchangeDescriptor, RegistryError> {
        let mut parts = channel.splitn(4, '.');
        let (Some(exchange), Some(asset_class), Some(data_type), Some(symbol)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(RegistryError::MalformedChannel(channel.to_string()));
        };

        Self::validate(&StreamRequest::new(exchange, asset_class, data_type, symbol))
    }

    /// Every supported (exchange, asset class, data type) combination.
    pub fn supported() -> impl Iterator<Item = (Exchange, AssetClass, DataType)> {
        Exchange::ALL.into_iter().flat_map(|exchange| {
            AssetClass::ALL.into_iter().flat_map(move |asset_class| {
                DataType::ALL
                    .into_iter()
                    .map(move |data_type| (exchange, asset_class, data_type))
            })
        })
    }
}
