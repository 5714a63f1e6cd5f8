//! In-Process Channel Transport
//!
//! A [`Transport`] fed by in-process producers instead of a socket. Each
//! dotted channel has a broadcast sender; producers push raw messages through
//! a [`ChannelPublisher`] and every handle connected to that channel receives
//! them from the moment it connects.
//!
//! # Example
//!
//! ```rust
//! use gq_feed::application::ports::Transport;
//! use gq_feed::infrastructure::transport::ChannelTransport;
//!
//! # tokio_test::block_on(async {
//! let transport = ChannelTransport::new(16);
//! let publisher = transport.publisher("coinbase.spot.trade.BTC-USD");
//!
//! let handle = transport.connect("coinbase", "spot", "trade", "BTC-USD").await.unwrap();
//! publisher.publish(r#"{"type":"heartbeat"}"#);
//!
//! assert_eq!(transport.read(handle).await.unwrap(), r#"{"type":"heartbeat"}"#);
//! # });
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::application::ports::{ConnectionHandle, Transport, TransportError};

/// Producer side of one channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    channel: String,
    tx: broadcast::Sender<String>,
}

impl ChannelPublisher {
    /// Dotted channel this publisher feeds.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Push one raw message. Returns the number of handles that will see it.
    pub fn publish(&self, raw: impl Into<String>) -> usize {
        self.tx.send(raw.into()).unwrap_or(0)
    }
}

struct ChannelConnection {
    rx: Mutex<broadcast::Receiver<String>>,
    invalidated: CancellationToken,
}

/// [`Transport`] backed by in-process broadcast channels.
pub struct ChannelTransport {
    capacity: usize,
    read_timeout: Option<Duration>,
    next_id: AtomicU64,
    channels: parking_lot::RwLock<HashMap<String, broadcast::Sender<String>>>,
    connections: parking_lot::RwLock<HashMap<ConnectionHandle, Arc<ChannelConnection>>>,
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("capacity", &self.capacity)
            .field("channels", &self.channels.read().len())
            .field("connections", &self.connections.read().len())
            .finish_non_exhaustive()
    }
}

impl ChannelTransport {
    /// Create a transport buffering up to `capacity` messages per channel.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            read_timeout: None,
            next_id: AtomicU64::new(1),
            channels: parking_lot::RwLock::new(HashMap::new()),
            connections: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Fail reads that wait longer than `timeout` with `ReadTimeout`.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Publisher for a dotted channel, registering the channel if needed.
    ///
    /// `connect` fails with `ConnectFailed` for channels nobody publishes.
    #[must_use]
    pub fn publisher(&self, channel: &str) -> ChannelPublisher {
        let tx = self
            .channels
            .write()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();

        ChannelPublisher {
            channel: channel.to_string(),
            tx,
        }
    }

    /// Invalidate a live handle; its next `read` fails with
    /// `HandleInvalidated`.
    pub fn invalidate(&self, handle: ConnectionHandle) {
        if let Some(connection) = self.connections.read().get(&handle) {
            connection.invalidated.cancel();
        }
    }

    /// Number of live handles.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.connections.read().len()
    }

    fn forget(&self, handle: ConnectionHandle) -> Option<Arc<ChannelConnection>> {
        self.connections.write().remove(&handle)
    }

    async fn next_message(
        &self,
        handle: ConnectionHandle,
        connection: &ChannelConnection,
    ) -> Result<String, TransportError> {
        let mut rx = connection.rx.lock().await;
        loop {
            let received = tokio::select! {
                biased;
                () = connection.invalidated.cancelled() => {
                    self.forget(handle);
                    return Err(invalidated(handle, "invalidated by producer"));
                }
                received = rx.recv() => received,
            };

            match received {
                Ok(raw) => return Ok(raw),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(handle = %handle, skipped, "Channel reader lagged, messages skipped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.forget(handle);
                    return Err(invalidated(handle, "channel closed"));
                }
            }
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(
        &self,
        exchange: &str,
        asset_class: &str,
        data_type: &str,
        symbol: &str,
    ) -> Result<ConnectionHandle, TransportError> {
        let channel = format!("{exchange}.{asset_class}.{data_type}.{symbol}");
        let rx = self
            .channels
            .read()
            .get(&channel)
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| TransportError::ConnectFailed(format!("no publisher for {channel}")))?;

        let handle = ConnectionHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.write().insert(
            handle,
            Arc::new(ChannelConnection {
                rx: Mutex::new(rx),
                invalidated: CancellationToken::new(),
            }),
        );
        Ok(handle)
    }

    async fn read(&self, handle: ConnectionHandle) -> Result<String, TransportError> {
        let connection = self.connections.read().get(&handle).cloned();
        let Some(connection) = connection else {
            return Err(invalidated(handle, "unknown or closed handle"));
        };

        match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.next_message(handle, &connection))
                .await
                .unwrap_or(Err(TransportError::ReadTimeout)),
            None => self.next_message(handle, &connection).await,
        }
    }

    async fn close(&self, handle: ConnectionHandle) {
        self.forget(handle);
    }
}

fn invalidated(handle: ConnectionHandle, reason: &str) -> TransportError {
    TransportError::HandleInvalidated {
        handle,
        reason: reason.to_string(),
    }
}
