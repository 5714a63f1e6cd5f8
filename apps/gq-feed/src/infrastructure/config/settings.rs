//! Feed Configuration Settings
//!
//! Configuration types for the feed service, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::registry::{ExchangeDescriptor, ExchangeRegistry, RegistryError};

/// Default gateway WebSocket endpoint.
pub const DEFAULT_GATEWAY_URL: &str = "ws://localhost:5050/ws";

/// Connection lifecycle settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Delay after the first failed connect attempt.
    pub connect_delay_initial: Duration,
    /// Maximum delay between connect attempts.
    pub connect_delay_max: Duration,
    /// Connect delay multiplier for exponential backoff.
    pub connect_delay_multiplier: f64,
    /// Total connect attempts before a descriptor fails.
    pub max_connect_attempts: u32,
    /// Consecutive read timeouts tolerated before forcing a reconnect.
    pub max_consecutive_timeouts: u32,
    /// Read timeout applied by the gateway transport.
    pub read_timeout: Duration,
    /// Capacity of each subscription's record channel.
    pub channel_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_delay_initial: Duration::from_millis(100),
            connect_delay_max: Duration::from_secs(30),
            connect_delay_multiplier: 2.0,
            max_connect_attempts: 5,
            max_consecutive_timeouts: 3,
            read_timeout: Duration::from_secs(30),
            channel_capacity: 1024,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

/// Complete feed configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Gateway WebSocket URL.
    pub gateway_url: String,
    /// Streams to subscribe on startup.
    pub streams: Vec<ExchangeDescriptor>,
    /// Connection lifecycle settings.
    pub connection: ConnectionSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Optional CSV export path.
    pub csv_path: Option<PathBuf>,
}

impl FeedConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `GQ_STREAMS` is missing, empty, or names an
    /// unsupported stream.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same conditions as [`FeedConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_streams =
            lookup("GQ_STREAMS").ok_or_else(|| ConfigError::MissingEnvVar("GQ_STREAMS".to_string()))?;
        let streams = parse_streams(&raw_streams)?;

        let gateway_url = lookup("GQ_GATEWAY_URL")
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string());

        let defaults = ConnectionSettings::default();
        let connection = ConnectionSettings {
            connect_delay_initial: parse_duration_millis(
                &lookup,
                "GQ_CONNECT_DELAY_INITIAL_MS",
                defaults.connect_delay_initial,
            ),
            connect_delay_max: parse_duration_secs(
                &lookup,
                "GQ_CONNECT_DELAY_MAX_SECS",
                defaults.connect_delay_max,
            ),
            connect_delay_multiplier: parse_or(
                &lookup,
                "GQ_CONNECT_DELAY_MULTIPLIER",
                defaults.connect_delay_multiplier,
            ),
            max_connect_attempts: parse_or(
                &lookup,
                "GQ_MAX_CONNECT_ATTEMPTS",
                defaults.max_connect_attempts,
            )
            .max(1),
            max_consecutive_timeouts: parse_or(
                &lookup,
                "GQ_MAX_CONSECUTIVE_TIMEOUTS",
                defaults.max_consecutive_timeouts,
            ),
            read_timeout: parse_duration_secs(&lookup, "GQ_READ_TIMEOUT_SECS", defaults.read_timeout),
            channel_capacity: parse_or(&lookup, "GQ_CHANNEL_CAPACITY", defaults.channel_capacity)
                .max(1),
        };

        let server = ServerSettings {
            metrics_port: parse_or(&lookup, "GQ_METRICS_PORT", 0),
        };

        let csv_path = lookup("GQ_CSV_PATH")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            gateway_url,
            streams,
            connection,
            server,
            csv_path,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// A configured stream is not supported.
    #[error("invalid stream {channel:?}: {source}")]
    InvalidStream {
        /// The offending channel entry.
        channel: String,
        /// Registry rejection.
        #[source]
        source: RegistryError,
    },
}

fn parse_streams(raw: &str) -> Result<Vec<ExchangeDescriptor>, ConfigError> {
    let mut streams = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let descriptor =
            ExchangeRegistry::parse_channel(entry).map_err(|source| ConfigError::InvalidStream {
                channel: entry.to_string(),
                source,
            })?;
        if !streams.contains(&descriptor) {
            streams.push(descriptor);
        }
    }

    if streams.is_empty() {
        return Err(ConfigError::EmptyValue("GQ_STREAMS".to_string()));
    }
    Ok(streams)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
