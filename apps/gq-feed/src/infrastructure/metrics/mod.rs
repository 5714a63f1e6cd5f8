//! Prometheus Metrics Module
//!
//! Exposes feed metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: Raw messages received, records yielded, messages dropped
//! - **Connections**: Reconnects, connect failures, read timeouts, open streams
//! - **Latency**: Normalization duration
//!
//! Every series is labelled by `exchange` and `data_type`. Recording is a
//! no-op until a recorder is installed, so library users that never call
//! [`init_metrics`] pay nothing.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::domain::registry::ExchangeDescriptor;

// =============================================================================
// Exporter
// =============================================================================

/// Configuration for the metrics exporter.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP listener.
    pub listen_addr: SocketAddr,
    /// Histogram buckets for normalization latency (in seconds).
    pub latency_buckets: Vec<f64>,
}

impl MetricsConfig {
    /// Create a configuration listening on all interfaces at `port`.
    #[must_use]
    pub fn with_port(port: u16) -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            // Latency buckets from 1us to 10ms
            latency_buckets: vec![
                0.000_001, 0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01,
            ],
        }
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// This starts an HTTP server that exposes metrics at `/metrics`.
///
/// # Errors
///
/// Returns an error if the metrics exporter fails to start (e.g., port already in use).
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .set_buckets(&config.latency_buckets)
        .map_err(|e| MetricsError::Configuration(e.to_string()))?
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    register_metrics();

    tracing::info!(
        addr = %config.listen_addr,
        "Prometheus metrics exporter started"
    );

    Ok(())
}

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to configure metrics exporter.
    #[error("metrics configuration error: {0}")]
    Configuration(String),
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "gq_feed_messages_received_total",
        "Total raw messages read from the transport"
    );
    describe_counter!(
        "gq_feed_records_yielded_total",
        "Total canonical records delivered to consumers"
    );
    describe_counter!(
        "gq_feed_messages_dropped_total",
        "Total raw messages dropped by reason"
    );
    describe_counter!(
        "gq_feed_reconnects_total",
        "Total reconnects after handle invalidation or repeated timeouts"
    );
    describe_counter!(
        "gq_feed_connect_failures_total",
        "Total failed connect attempts"
    );
    describe_counter!(
        "gq_feed_read_timeouts_total",
        "Total transport read timeouts"
    );
    describe_gauge!("gq_feed_open_streams", "Number of running stream loops");
    describe_histogram!(
        "gq_feed_normalize_seconds",
        "Time to normalize one raw message"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reason a raw message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Payload was not well-formed for the exchange encoding.
    Parse,
    /// Payload violated a canonical invariant.
    Schema,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Schema => "schema",
        }
    }
}

/// Record a raw message read from the transport.
pub fn record_message_received(descriptor: &ExchangeDescriptor) {
    counter!(
        "gq_feed_messages_received_total",
        "exchange" => descriptor.exchange().as_str(),
        "data_type" => descriptor.data_type().as_str()
    )
    .increment(1);
}

/// Record a canonical record delivered to the consumer.
pub fn record_record_yielded(descriptor: &ExchangeDescriptor) {
    counter!(
        "gq_feed_records_yielded_total",
        "exchange" => descriptor.exchange().as_str(),
        "data_type" => descriptor.data_type().as_str()
    )
    .increment(1);
}

/// Record a dropped raw message.
pub fn record_message_dropped(descriptor: &ExchangeDescriptor, reason: DropReason) {
    counter!(
        "gq_feed_messages_dropped_total",
        "exchange" => descriptor.exchange().as_str(),
        "data_type" => descriptor.data_type().as_str(),
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a reconnect.
pub fn record_reconnect(descriptor: &ExchangeDescriptor) {
    counter!(
        "gq_feed_reconnects_total",
        "exchange" => descriptor.exchange().as_str(),
        "data_type" => descriptor.data_type().as_str()
    )
    .increment(1);
}

/// Record a failed connect attempt.
pub fn record_connect_failure(descriptor: &ExchangeDescriptor) {
    counter!(
        "gq_feed_connect_failures_total",
        "exchange" => descriptor.exchange().as_str(),
        "data_type" => descriptor.data_type().as_str()
    )
    .increment(1);
}

/// Record a transport read timeout.
pub fn record_read_timeout(descriptor: &ExchangeDescriptor) {
    counter!(
        "gq_feed_read_timeouts_total",
        "exchange" => descriptor.exchange().as_str(),
        "data_type" => descriptor.data_type().as_str()
    )
    .increment(1);
}

/// Adjust the running stream gauge by `delta`.
pub fn adjust_open_streams(descriptor: &ExchangeDescriptor, delta: f64) {
    gauge!(
        "gq_feed_open_streams",
        "exchange" => descriptor.exchange().as_str(),
        "data_type" => descriptor.data_type().as_str()
    )
    .increment(delta);
}

/// Record normalization duration.
pub fn record_normalize_duration(descriptor: &ExchangeDescriptor, duration: Duration) {
    histogram!(
        "gq_feed_normalize_seconds",
        "exchange" => descriptor.exchange().as_str(),
        "data_type" => descriptor.data_type().as_str()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::Parse.as_str(), "parse");
        assert_eq!(DropReason::Schema.as_str(), "schema");
    }

    #[test]
    fn metrics_config_binds_all_interfaces() {
        let config = MetricsConfig::with_port(9464);
        assert_eq!(config.listen_addr, SocketAddr::from(([0, 0, 0, 0], 9464)));
        assert!(!config.latency_buckets.is_empty());
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        let descriptor = crate::domain::registry::ExchangeRegistry::parse_channel(
            "coinbase.spot.trade.BTC-USD",
        )
        .unwrap();
        record_message_received(&descriptor);
        record_message_dropped(&descriptor, DropReason::Parse);
        adjust_open_streams(&descriptor, 1.0);
        record_normalize_duration(&descriptor, Duration::from_micros(3));
    }
}
