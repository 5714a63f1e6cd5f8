//! Connection Manager
//!
//! Owns the live handle of every open descriptor and drives its lifecycle:
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──(error)──► Reconnecting ──► Connecting ──► …
//!                                                         (any) ──close──► Closed
//! ```
//!
//! Each descriptor has its own async mutex guarding the handle and retry
//! state, plus a cancellation token. The registry map lock is only held for
//! lookups, so a descriptor sleeping in backoff or blocked in `read` never
//! stalls another descriptor.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::backoff::{BackoffConfig, BackoffPolicy};
use crate::application::ports::{ConnectionHandle, Transport, TransportError};
use crate::domain::registry::{ExchangeDescriptor, ExchangeRegistry, RegistryError, StreamRequest};
use crate::infrastructure::metrics;

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in progress.
    Disconnected,
    /// A connect attempt (or its backoff) is in progress.
    Connecting,
    /// A live handle is held.
    Connected,
    /// The previous handle was discarded; waiting to connect again.
    Reconnecting,
    /// Explicitly closed. Terminal until reopened.
    Closed,
}

impl ConnectionState {
    /// Lowercase name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection manager settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connect retry policy.
    pub backoff: BackoffConfig,
    /// Consecutive read timeouts tolerated before forcing a reconnect.
    pub max_consecutive_timeouts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_consecutive_timeouts: 3,
        }
    }
}

impl ConnectionConfig {
    /// Create configuration from `ConnectionSettings`.
    #[must_use]
    pub const fn from_connection_settings(settings: &crate::ConnectionSettings) -> Self {
        Self {
            backoff: BackoffConfig::from_connection_settings(settings),
            max_consecutive_timeouts: settings.max_consecutive_timeouts,
        }
    }
}

/// Connection lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The requested stream is not supported.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The transport cannot be used at all.
    #[error("transport unavailable for {channel}: {reason}")]
    TransportUnavailable {
        /// Descriptor channel.
        channel: String,
        /// Transport-provided reason.
        reason: String,
    },

    /// Every connect attempt failed.
    #[error("connect failed for {channel} after {attempts} attempts: {reason}")]
    ConnectFailed {
        /// Descriptor channel.
        channel: String,
        /// Attempts made.
        attempts: u32,
        /// Reason of the last failure.
        reason: String,
    },

    /// A read failed and must be handed to [`ConnectionManager::on_read_error`].
    #[error("read failed on {channel}: {source}")]
    Read {
        /// Descriptor channel.
        channel: String,
        /// Transport error.
        #[source]
        source: TransportError,
    },

    /// The descriptor was closed.
    #[error("{channel} is closed")]
    Closed {
        /// Descriptor channel.
        channel: String,
    },

    /// The descriptor has never been opened.
    #[error("{channel} is not open")]
    NotOpen {
        /// Descriptor channel.
        channel: String,
    },
}

impl ConnectionError {
    /// Whether the descriptor ended because it was closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

/// Outcome of handling a read error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Keep reading the same handle.
    Retry {
        /// Consecutive timeouts seen so far.
        consecutive_timeouts: u32,
    },
    /// The old handle was discarded and a new one is live.
    Reconnected(ConnectionHandle),
}

// =============================================================================
// Registry Entries
// =============================================================================

#[derive(Debug)]
struct ConnectionSlot {
    handle: Option<ConnectionHandle>,
    consecutive_timeouts: u32,
    policy: BackoffPolicy,
}

#[derive(Debug)]
struct ConnectionEntry {
    state: RwLock<ConnectionState>,
    slot: Mutex<ConnectionSlot>,
    cancel: CancellationToken,
}

impl ConnectionEntry {
    fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            slot: Mutex::new(ConnectionSlot {
                handle: None,
                consecutive_timeouts: 0,
                policy: BackoffPolicy::new(backoff),
            }),
            cancel: CancellationToken::new(),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Move to `next` unless the entry was closed meanwhile.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.write();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = next;
        true
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Per-descriptor connection lifecycle over a [`Transport`].
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    entries: RwLock<HashMap<ExchangeDescriptor, Arc<ConnectionEntry>>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("descriptors", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Validate a request and open it.
    ///
    /// # Errors
    ///
    /// Registry rejections, plus everything [`ConnectionManager::open`] returns.
    pub async fn open_request(
        &self,
        request: &StreamRequest,
    ) -> Result<(ExchangeDescriptor, ConnectionHandle), ConnectionError> {
        let descriptor = ExchangeRegistry::validate(request)?;
        let handle = self.open(&descriptor).await?;
        Ok((descriptor, handle))
    }

    /// Open a descriptor, retrying failed connects with backoff.
    ///
    /// Returns the existing handle when the descriptor is already connected.
    /// A closed descriptor starts a fresh lifecycle.
    ///
    /// # Errors
    ///
    /// - `TransportUnavailable` immediately, never retried
    /// - `ConnectFailed` once the attempt bound is exhausted
    /// - `Closed` if the descriptor is closed while connecting
    pub async fn open(
        &self,
        descriptor: &ExchangeDescriptor,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let entry = self.entry_for_open(descriptor);
        let mut slot = entry.slot.lock().await;

        if entry.state() == ConnectionState::Connected
            && let Some(handle) = slot.handle
        {
            return Ok(handle);
        }

        self.connect_locked(descriptor, &entry, &mut slot).await
    }

    /// Read the next raw message of an open descriptor.
    ///
    /// Holds the descriptor's lock for the duration of the call; closing the
    /// descriptor aborts the read.
    ///
    /// # Errors
    ///
    /// - `Read` wrapping the transport error, to be passed to
    ///   [`ConnectionManager::on_read_error`]
    /// - `Closed` when the descriptor is closed
    /// - `NotOpen` when the descriptor was never opened or holds no handle
    pub async fn read(&self, descriptor: &ExchangeDescriptor) -> Result<String, ConnectionError> {
        let entry = self.lookup(descriptor)?;
        let cancel = entry.cancel.clone();

        let mut slot = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(closed(descriptor)),
            slot = entry.slot.lock() => slot,
        };

        let Some(handle) = slot.handle else {
            return Err(ConnectionError::NotOpen {
                channel: descriptor.channel(),
            });
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(closed(descriptor)),
            result = self.transport.read(handle) => match result {
                Ok(raw) => {
                    slot.consecutive_timeouts = 0;
                    Ok(raw)
                }
                Err(source) => Err(ConnectionError::Read {
                    channel: descriptor.channel(),
                    source,
                }),
            },
        }
    }

    /// Handle a failed read.
    ///
    /// `ReadTimeout` keeps the handle until the consecutive timeout bound is
    /// reached; anything else discards the handle and reconnects after a
    /// backoff delay.
    ///
    /// # Errors
    ///
    /// Fatal connect errors from the reconnect, or `Closed`.
    pub async fn on_read_error(
        &self,
        descriptor: &ExchangeDescriptor,
        error: &TransportError,
    ) -> Result<Recovery, ConnectionError> {
        let entry = self.lookup(descriptor)?;
        let mut slot = entry.slot.lock().await;

        if entry.state() == ConnectionState::Closed {
            return Err(closed(descriptor));
        }

        let force_close = if *error == TransportError::ReadTimeout {
            metrics::record_read_timeout(descriptor);
            slot.consecutive_timeouts = slot.consecutive_timeouts.saturating_add(1);
            if slot.consecutive_timeouts < self.config.max_consecutive_timeouts {
                warn!(
                    channel = %descriptor,
                    consecutive = slot.consecutive_timeouts,
                    limit = self.config.max_consecutive_timeouts,
                    "Read timed out, retrying same handle"
                );
                return Ok(Recovery::Retry {
                    consecutive_timeouts: slot.consecutive_timeouts,
                });
            }
            warn!(
                channel = %descriptor,
                consecutive = slot.consecutive_timeouts,
                "Too many consecutive read timeouts, forcing reconnect"
            );
            true
        } else {
            warn!(channel = %descriptor, error = %error, "Handle invalidated, reconnecting");
            false
        };

        let old = slot.handle.take();
        if force_close && let Some(handle) = old {
            self.transport.close(handle).await;
        }

        if !entry.transition(ConnectionState::Reconnecting) {
            return Err(closed(descriptor));
        }
        metrics::record_reconnect(descriptor);

        let delay = slot.policy.reconnect_delay();
        info!(
            channel = %descriptor,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnect"
        );
        tokio::select! {
            biased;
            () = entry.cancel.cancelled() => return Err(closed(descriptor)),
            () = tokio::time::sleep(delay) => {}
        }

        let handle = self.connect_locked(descriptor, &entry, &mut slot).await?;
        Ok(Recovery::Reconnected(handle))
    }

    /// Close a descriptor. Idempotent; unknown descriptors are ignored.
    pub async fn close(&self, descriptor: &ExchangeDescriptor) {
        let Some(entry) = self.entries.read().get(descriptor).cloned() else {
            return;
        };

        {
            let mut state = entry.state.write();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        entry.cancel.cancel();

        let handle = entry.slot.lock().await.handle.take();
        if let Some(handle) = handle {
            self.transport.close(handle).await;
        }

        info!(channel = %descriptor, "Connection closed");
    }

    /// Close a descriptor from synchronous code, such as a `Drop` impl.
    ///
    /// The state change and cancellation happen before returning; the held
    /// handle is taken and closed on a spawned task once the slot frees up.
    /// Outside a runtime the handle is left for the transport to reclaim.
    pub fn close_detached(&self, descriptor: &ExchangeDescriptor) {
        let Some(entry) = self.entries.read().get(descriptor).cloned() else {
            return;
        };

        {
            let mut state = entry.state.write();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        entry.cancel.cancel();

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            runtime.spawn(async move {
                let handle = entry.slot.lock().await.handle.take();
                if let Some(handle) = handle {
                    transport.close(handle).await;
                }
            });
        }

        warn!(channel = %descriptor, "Connection closed without waiting");
    }

    /// Current state of a descriptor. Unknown descriptors are `Disconnected`.
    #[must_use]
    pub fn state(&self, descriptor: &ExchangeDescriptor) -> ConnectionState {
        self.entries
            .read()
            .get(descriptor)
            .map_or(ConnectionState::Disconnected, |entry| entry.state())
    }

    /// Token cancelled when the descriptor's current lifecycle is closed.
    #[must_use]
    pub fn cancellation(&self, descriptor: &ExchangeDescriptor) -> Option<CancellationToken> {
        self.entries
            .read()
            .get(descriptor)
            .map(|entry| entry.cancel.clone())
    }

    /// Descriptors not yet closed.
    #[must_use]
    pub fn active_descriptors(&self) -> Vec<ExchangeDescriptor> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.state() != ConnectionState::Closed)
            .map(|(descriptor, _)| descriptor.clone())
            .collect()
    }

    /// Close every descriptor.
    pub async fn shutdown(&self) {
        let descriptors: Vec<ExchangeDescriptor> = self.entries.read().keys().cloned().collect();
        for descriptor in &descriptors {
            self.close(descriptor).await;
        }
        info!(count = descriptors.len(), "Connection manager shut down");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn lookup(&self, descriptor: &ExchangeDescriptor) -> Result<Arc<ConnectionEntry>, ConnectionError> {
        self.entries
            .read()
            .get(descriptor)
            .cloned()
            .ok_or_else(|| ConnectionError::NotOpen {
                channel: descriptor.channel(),
            })
    }

    fn entry_for_open(&self, descriptor: &ExchangeDescriptor) -> Arc<ConnectionEntry> {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(descriptor)
            && entry.state() != ConnectionState::Closed
        {
            return Arc::clone(entry);
        }

        let entry = Arc::new(ConnectionEntry::new(self.config.backoff.clone()));
        entries.insert(descriptor.clone(), Arc::clone(&entry));
        entry
    }

    async fn connect_locked(
        &self,
        descriptor: &ExchangeDescriptor,
        entry: &ConnectionEntry,
        slot: &mut ConnectionSlot,
    ) -> Result<ConnectionHandle, ConnectionError> {
        if !entry.transition(ConnectionState::Connecting) {
            return Err(closed(descriptor));
        }
        slot.policy.reset();

        loop {
            let attempt = slot.policy.failures() + 1;
            let result = tokio::select! {
                biased;
                () = entry.cancel.cancelled() => return Err(closed(descriptor)),
                result = self.transport.connect(
                    descriptor.exchange().as_str(),
                    descriptor.asset_class().as_str(),
                    descriptor.data_type().as_str(),
                    descriptor.symbol(),
                ) => result,
            };

            let reason = match result {
                Ok(handle) => {
                    if !entry.transition(ConnectionState::Connected) {
                        self.transport.close(handle).await;
                        return Err(closed(descriptor));
                    }
                    slot.handle = Some(handle);
                    slot.consecutive_timeouts = 0;
                    slot.policy.reset();
                    info!(channel = %descriptor, handle = %handle, attempt, "Connected");
                    return Ok(handle);
                }
                Err(TransportError::Unavailable(reason)) => {
                    entry.transition(ConnectionState::Disconnected);
                    error!(channel = %descriptor, error = %reason, "Transport unavailable");
                    return Err(ConnectionError::TransportUnavailable {
                        channel: descriptor.channel(),
                        reason,
                    });
                }
                Err(other) => other.to_string(),
            };

            metrics::record_connect_failure(descriptor);

            let Some(delay) = slot.policy.record_failure() else {
                entry.transition(ConnectionState::Disconnected);
                error!(
                    channel = %descriptor,
                    attempts = attempt,
                    error = %reason,
                    "Connect attempts exhausted"
                );
                return Err(ConnectionError::ConnectFailed {
                    channel: descriptor.channel(),
                    attempts: attempt,
                    reason,
                });
            };

            warn!(
                channel = %descriptor,
                attempt,
                max_attempts = slot.policy.max_attempts(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %reason,
                "Connect failed, backing off"
            );

            tokio::select! {
                biased;
                () = entry.cancel.cancelled() => return Err(closed(descriptor)),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn closed(descriptor: &ExchangeDescriptor) -> ConnectionError {
    ConnectionError::Closed {
        channel: descriptor.channel(),
    }
}

// =============================================================================
// Tests
// =============================================================================
