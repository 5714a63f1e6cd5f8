//! Application Services
//!
//! Services that drive the stream lifecycle over the transport port.
//!
//! - `BackoffPolicy`: Exponential delays for connect retries
//! - `ConnectionManager`: Per-descriptor connect, read, reconnect and close
//! - `FeedService`: Per-descriptor read loops feeding normalized records to consumers

/// Exponential backoff for connect retries.
pub mod backoff;

/// Per-descriptor connection state machine.
pub mod connection;

/// Streaming read loops and consumer subscriptions.
pub mod stream;
