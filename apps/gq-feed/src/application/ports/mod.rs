//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: connect/read/close against the transport module that owns
//!   socket I/O and exchange subscription. The connection manager depends
//!   only on this trait, never on how the implementation was located or
//!   loaded.

use std::fmt;

use async_trait::async_trait;

/// Opaque token for one physical connection.
///
/// Issued by a transport on `connect`; never reused after it is closed or
/// invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    /// Wrap a transport-issued identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Transport-issued identifier.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport module itself cannot be used. Fatal.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// A connection attempt failed. Retried with backoff.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The handle is no longer usable. Triggers a reconnect.
    #[error("handle {handle} invalidated: {reason}")]
    HandleInvalidated {
        /// The invalidated handle.
        handle: ConnectionHandle,
        /// Transport-provided reason.
        reason: String,
    },

    /// No message arrived within the read deadline. Transient.
    #[error("read timed out")]
    ReadTimeout,
}

/// Transport module contract.
///
/// Arguments to `connect` are the registry's lowercase wire names, passed as
/// plain strings. One `read` returns exactly one logical message. Callers
/// never issue two concurrent `read`s on the same handle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection subscribed to one stream.
    async fn connect(
        &self,
        exchange: &str,
        asset_class: &str,
        data_type: &str,
        symbol: &str,
    ) -> Result<ConnectionHandle, TransportError>;

    /// Read the next raw message.
    async fn read(&self, handle: ConnectionHandle) -> Result<String, TransportError>;

    /// Release a connection. Unknown handles are ignored.
    async fn close(&self, handle: ConnectionHandle);
}
