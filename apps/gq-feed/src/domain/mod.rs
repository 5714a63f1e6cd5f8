//! Domain Layer - Canonical market data types and the exchange registry.
//!
//! This layer has no I/O. Everything here is pure Rust with serialization
//! support.

/// Exchange, asset class and data type enumeration plus request validation.
pub mod registry;

/// Canonical record shapes (OHLC, quote, time, trade, ticker envelope).
pub mod streaming;
