//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the connection lifecycle and streaming services and
//! the transport port they drive.

/// Port interfaces for external systems (transport module).
pub mod ports;

/// Connection management and per-descriptor streaming services.
pub mod services;
