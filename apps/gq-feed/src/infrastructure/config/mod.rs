//! Configuration Module
//!
//! Configuration loading for the feed service.

mod settings;

pub use settings::{
    ConfigError, ConnectionSettings, DEFAULT_GATEWAY_URL, FeedConfig, ServerSettings,
};
