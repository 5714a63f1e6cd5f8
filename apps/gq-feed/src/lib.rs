#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::unreadable_literal
    )
)]

//! GQ Feed - Multi-Exchange Market Data Normalizer
//!
//! Keeps one independently reconnecting stream per exchange descriptor and
//! turns exchange-native payloads into the canonical [`TickerData`] record.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Canonical types and stream validation
//!   - `registry`: Supported exchanges, asset classes and data types
//!   - `streaming`: `TickerData` and its invariants
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: The `Transport` contract (connect/read/close)
//!   - `services`: Backoff, connection lifecycle, streaming read loops
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `transport`: Gateway WebSocket and in-process channel transports
//!   - `normalizer`: Binance, Coinbase, Kraken, Bitfinex and gateway decoding
//!   - `export`: CSV sink
//!   - `config`, `metrics`, `telemetry`: Process plumbing
//!
//! # Data Flow
//!
//! ```text
//!                  ┌───────────────────┐     ┌────────────┐     ┌──────────────────┐
//! Transport ◄─────►│ ConnectionManager │◄────│ read loop  │────►│ FeedSubscription │──► consumer
//! (connect/read/   │  (per descriptor  │     │ Normalizer │     │  (bounded mpsc)  │
//!  close)          │   state machine)  │     └────────────┘     └──────────────────┘
//!                  └───────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use gq_feed::{ChannelTransport, ConnectionConfig, FeedService, StreamRequest};
//!
//! # tokio_test::block_on(async {
//! let transport = Arc::new(ChannelTransport::new(16));
//! let publisher = transport.publisher("coinbase.spot.trade.BTC-USD");
//!
//! let service = FeedService::new(transport, ConnectionConfig::default(), 16);
//! let mut subscription = service
//!     .subscribe(&StreamRequest::new("coinbase", "spot", "trade", "BTC-USD"))
//!     .unwrap();
//!
//! // Wait until the stream is connected before publishing
//! while service.state(subscription.descriptor()) != gq_feed::ConnectionState::Connected {
//!     tokio::task::yield_now().await;
//! }
//! publisher.publish(
//!     r#"{"type":"match","trade_id":1,"product_id":"BTC-USD","size":"0.5","price":"400.23","time":"2023-03-08T22:19:17.000Z"}"#,
//! );
//!
//! let record = subscription.recv().await.unwrap();
//! assert_eq!(record.channel, "coinbase.spot.trade.BTC-USD");
//! service.shutdown().await;
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Canonical types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::registry::{
    AssetClass, DataType, Exchange, ExchangeDescriptor, ExchangeRegistry, RegistryError,
    StreamRequest,
};
pub use domain::streaming::{MarketTime, Ohlcv, Quote, SchemaViolation, TickerData, Trade};

// Transport port
pub use application::ports::{ConnectionHandle, Transport, TransportError};

// Services
pub use application::services::backoff::{BackoffConfig, BackoffPolicy};
pub use application::services::connection::{
    ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState, Recovery,
};
pub use application::services::stream::{
    FeedService, FeedSubscription, StreamError, StreamExit, StreamStats,
};

// Normalizer
pub use infrastructure::normalizer::{NormalizeError, NormalizeErrorKind, Normalizer};

// Transports
pub use infrastructure::transport::{
    ChannelPublisher, ChannelTransport, GatewayConfig, GatewayTransport,
};

// Export
pub use infrastructure::export::{CsvExporter, ExportError};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ConnectionSettings, FeedConfig, ServerSettings};

// Metrics
pub use infrastructure::metrics::{MetricsConfig, MetricsError, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
