//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the transport port,
//! the exchange payload normalizer, and the process-level plumbing.

/// Transport adapters (gateway WebSocket, in-process channels).
pub mod transport;

/// Exchange-native payload decoding into canonical records.
pub mod normalizer;

/// CSV export of canonical records.
pub mod export;

/// Configuration loading from the environment.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
