//! Gateway WebSocket Transport
//!
//! Opens one WebSocket per stream to the GQ gateway and subscribes it to the
//! stream's channel.
//!
//! # Protocol
//!
//! ```json
//! {"event":"subscribe","channel":"coinbase.spot.trade.BTC-USD"}
//! ```
//!
//! After the subscribe request every text frame is one raw exchange message.
//! A pump task per handle forwards frames into a bounded channel that `read`
//! drains; pings are answered by the pump.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::ports::{ConnectionHandle, Transport, TransportError};
use crate::infrastructure::config::{DEFAULT_GATEWAY_URL, FeedConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frame forwarded by the pump; `Err` carries the invalidation reason.
type Frame = Result<String, String>;

// =============================================================================
// Messages
// =============================================================================

/// Subscribe request sent right after the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    event: &'static str,
    channel: String,
}

impl SubscribeRequest {
    /// Request for `{exchange}.{asset_class}.{data_type}.{symbol}`.
    #[must_use]
    pub fn new(exchange: &str, asset_class: &str, data_type: &str, symbol: &str) -> Self {
        Self {
            event: "subscribe",
            channel: format!("{exchange}.{asset_class}.{data_type}.{symbol}"),
        }
    }

    /// Dotted channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Gateway transport settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway.
    pub url: String,
    /// Deadline for one `read`, and for the handshake plus subscribe send of
    /// one `connect`.
    pub read_timeout: Duration,
    /// Frames buffered per handle before the pump waits.
    pub buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            read_timeout: Duration::from_secs(30),
            buffer: 1024,
        }
    }
}

impl GatewayConfig {
    /// Create configuration from the feed configuration.
    #[must_use]
    pub fn from_feed_config(config: &FeedConfig) -> Self {
        Self {
            url: config.gateway_url.clone(),
            read_timeout: config.connection.read_timeout,
            buffer: config.connection.channel_capacity,
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

struct GatewayConnection {
    channel: String,
    frames: Mutex<mpsc::Receiver<Frame>>,
    cancel: CancellationToken,
}

/// [`Transport`] over the gateway's WebSocket endpoint.
pub struct GatewayTransport {
    config: GatewayConfig,
    next_id: AtomicU64,
    connections: parking_lot::RwLock<HashMap<ConnectionHandle, Arc<GatewayConnection>>>,
}

impl std::fmt::Debug for GatewayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayTransport")
            .field("url", &self.config.url)
            .field("connections", &self.connections.read().len())
            .finish_non_exhaustive()
    }
}

impl GatewayTransport {
    /// Create a transport; no connection is made until `connect`.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            connections: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Number of live handles.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.connections.read().len()
    }

    fn forget(&self, handle: ConnectionHandle) -> Option<Arc<GatewayConnection>> {
        self.connections.write().remove(&handle)
    }
}

#[async_trait]
impl Transport for GatewayTransport {
    async fn connect(
        &self,
        exchange: &str,
        asset_class: &str,
        data_type: &str,
        symbol: &str,
    ) -> Result<ConnectionHandle, TransportError> {
        let request = SubscribeRequest::new(exchange, asset_class, data_type, symbol);
        debug!(url = %self.config.url, channel = %request.channel(), "Connecting to gateway");

        let json = serde_json::to_string(&request).map_err(|e| {
            TransportError::ConnectFailed(format!("failed to serialize subscribe: {e}"))
        })?;

        let subscribe = async {
            let (ws_stream, _response) =
                tokio_tungstenite::connect_async(self.config.url.as_str())
                    .await
                    .map_err(|e| match &e {
                        tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_) => {
                            TransportError::Unavailable(format!(
                                "invalid gateway url {}: {e}",
                                self.config.url
                            ))
                        }
                        _ => TransportError::ConnectFailed(e.to_string()),
                    })?;

            let (mut write, read) = ws_stream.split();
            write.send(Message::Text(json.into())).await.map_err(|e| {
                TransportError::ConnectFailed(format!("failed to send subscribe: {e}"))
            })?;
            Ok::<_, TransportError>((write, read))
        };

        let (write, read) = tokio::time::timeout(self.config.read_timeout, subscribe)
            .await
            .map_err(|_elapsed| {
                TransportError::ConnectFailed(format!(
                    "gateway did not accept subscription within {:?}",
                    self.config.read_timeout
                ))
            })??;

        let handle = ConnectionHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let cancel = CancellationToken::new();

        tokio::spawn(pump(handle, read, write, tx, cancel.clone()));

        self.connections.write().insert(
            handle,
            Arc::new(GatewayConnection {
                channel: request.channel,
                frames: Mutex::new(rx),
                cancel,
            }),
        );

        info!(handle = %handle, url = %self.config.url, "Gateway stream subscribed");
        Ok(handle)
    }

    async fn read(&self, handle: ConnectionHandle) -> Result<String, TransportError> {
        let connection = self.connections.read().get(&handle).cloned();
        let Some(connection) = connection else {
            return Err(invalidated(handle, "unknown or closed handle"));
        };

        let mut frames = connection.frames.lock().await;
        match tokio::time::timeout(self.config.read_timeout, frames.recv()).await {
            Err(_elapsed) => Err(TransportError::ReadTimeout),
            Ok(Some(Ok(text))) => Ok(text),
            Ok(Some(Err(reason))) => {
                self.forget(handle);
                warn!(
                    handle = %handle,
                    channel = %connection.channel,
                    reason = %reason,
                    "Gateway stream lost"
                );
                Err(invalidated(handle, reason))
            }
            Ok(None) => {
                self.forget(handle);
                Err(invalidated(handle, "connection closed"))
            }
        }
    }

    async fn close(&self, handle: ConnectionHandle) {
        if let Some(connection) = self.forget(handle) {
            connection.cancel.cancel();
            debug!(handle = %handle, channel = %connection.channel, "Gateway stream closed");
        }
    }
}

fn invalidated(handle: ConnectionHandle, reason: impl Into<String>) -> TransportError {
    TransportError::HandleInvalidated {
        handle,
        reason: reason.into(),
    }
}

/// Forward frames until the socket ends, the reader goes away, or the handle
/// is closed.
async fn pump(
    handle: ConnectionHandle,
    mut read: SplitStream<WsStream>,
    mut write: SplitSink<WsStream, Message>,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    let lost = loop {
        let msg = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            msg = read.next() => msg,
        };

        let frame = match msg {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!(handle = %handle, len = bytes.len(), "Dropped non-UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = write.send(Message::Pong(data)).await {
                    break format!("failed to answer ping: {e}");
                }
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or_else(
                    || "server sent close frame".to_string(),
                    |f| format!("server closed: {} {}", f.code, f.reason),
                );
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        };

        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            sent = tx.send(Ok(frame)) => sent,
        };
        if sent.is_err() {
            return;
        }
    };

    let _ = tx.send(Err(lost)).await;
}

// =============================================================================
// Tests
// =============================================================================
