//! Streaming Read Loop
//!
//! One tokio task per subscribed descriptor:
//!
//! ```text
//! open ──► read ──► normalize ──► mpsc ──► FeedSubscription (Stream)
//!            │           │
//!            │           └─ parse/schema error: drop, keep reading
//!            └─ transport error ──► on_read_error ──► retry / new handle / fatal
//! ```
//!
//! The loop owns the descriptor's [`Normalizer`], so the event-time
//! watermarks and the order book survive reconnects. A full consumer channel suspends only this loop.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::{
    ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState, Recovery,
};
use crate::application::ports::{Transport, TransportError};
use crate::domain::registry::{ExchangeDescriptor, ExchangeRegistry, StreamRequest};
use crate::domain::streaming::TickerData;
use crate::infrastructure::metrics::{self, DropReason};
use crate::infrastructure::normalizer::{NormalizeErrorKind, Normalizer};

// =============================================================================
// Outcomes
// =============================================================================

/// Clean end of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    /// The descriptor was closed.
    Closed,
    /// The consumer dropped its receiver.
    ConsumerDropped,
}

/// Terminal stream failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Fatal connection failure (unsupported stream, unavailable transport,
    /// exhausted connect attempts).
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Another subscription already reads this descriptor.
    #[error("{channel} already has an active subscription")]
    AlreadySubscribed {
        /// Descriptor channel.
        channel: String,
    },

    /// The stream task panicked or was aborted.
    #[error("stream task for {channel} failed: {reason}")]
    Task {
        /// Descriptor channel.
        channel: String,
        /// Join error description.
        reason: String,
    },
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default)]
struct StreamCounters {
    received: AtomicU64,
    yielded: AtomicU64,
    dropped_parse: AtomicU64,
    dropped_schema: AtomicU64,
    control: AtomicU64,
    reconnects: AtomicU64,
    timeouts: AtomicU64,
}

impl StreamCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StreamStats {
        StreamStats {
            received: self.received.load(Ordering::Relaxed),
            yielded: self.yielded.load(Ordering::Relaxed),
            dropped_parse: self.dropped_parse.load(Ordering::Relaxed),
            dropped_schema: self.dropped_schema.load(Ordering::Relaxed),
            control: self.control.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Per-descriptor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Raw messages read.
    pub received: u64,
    /// Records handed to the consumer.
    pub yielded: u64,
    /// Messages dropped as malformed.
    pub dropped_parse: u64,
    /// Messages dropped for invariant violations.
    pub dropped_schema: u64,
    /// Control frames skipped.
    pub control: u64,
    /// Handles replaced after a read error.
    pub reconnects: u64,
    /// Read timeouts seen.
    pub timeouts: u64,
}

impl StreamStats {
    /// Messages dropped for any reason.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped_parse + self.dropped_schema
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Consumer side of one descriptor's stream.
///
/// Yields records in the order their raw messages were read. Also usable as a
/// [`Stream`] of [`TickerData`].
#[derive(Debug)]
pub struct FeedSubscription {
    descriptor: ExchangeDescriptor,
    records: ReceiverStream<TickerData>,
    task: JoinHandle<Result<StreamExit, StreamError>>,
    counters: Arc<StreamCounters>,
}

impl FeedSubscription {
    /// Descriptor this subscription reads.
    #[must_use]
    pub const fn descriptor(&self) -> &ExchangeDescriptor {
        &self.descriptor
    }

    /// Next record, or `None` once the stream has ended and the buffer is
    /// drained.
    pub async fn recv(&mut self) -> Option<TickerData> {
        self.records.as_mut().recv().await
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    /// Stop consuming and wait for the stream's outcome.
    ///
    /// Buffered records are discarded. A stream still running ends with
    /// [`StreamExit::ConsumerDropped`].
    ///
    /// # Errors
    ///
    /// The terminal [`StreamError`] of the read loop.
    pub async fn join(self) -> Result<StreamExit, StreamError> {
        let Self {
            descriptor,
            records,
            task,
            ..
        } = self;
        drop(records);

        task.await.unwrap_or_else(|join_error| {
            Err(StreamError::Task {
                channel: descriptor.channel(),
                reason: join_error.to_string(),
            })
        })
    }
}

impl Stream for FeedSubscription {
    type Item = TickerData;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.records).poll_next(cx)
    }
}

// =============================================================================
// Feed Service
// =============================================================================

/// Spawns and tracks per-descriptor read loops.
#[derive(Debug, Clone)]
pub struct FeedService {
    connections: Arc<ConnectionManager>,
    channel_capacity: usize,
    active: Arc<RwLock<HashSet<ExchangeDescriptor>>>,
}

impl FeedService {
    /// Create a service over `transport`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        channel_capacity: usize,
    ) -> Self {
        Self::with_manager(
            Arc::new(ConnectionManager::new(transport, config)),
            channel_capacity,
        )
    }

    /// Create a service sharing an existing connection manager.
    #[must_use]
    pub fn with_manager(connections: Arc<ConnectionManager>, channel_capacity: usize) -> Self {
        Self {
            connections,
            channel_capacity: channel_capacity.max(1),
            active: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Underlying connection manager.
    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Validate a request and start streaming it.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Registry rejections (no transport call is made) or
    /// [`StreamError::AlreadySubscribed`].
    pub fn subscribe(&self, request: &StreamRequest) -> Result<FeedSubscription, StreamError> {
        let descriptor = ExchangeRegistry::validate(request).map_err(ConnectionError::from)?;
        self.subscribe_descriptor(descriptor)
    }

    /// Start streaming an already validated descriptor.
    ///
    /// # Errors
    ///
    /// [`StreamError::AlreadySubscribed`] while another subscription for the
    /// same descriptor is running.
    pub fn subscribe_descriptor(
        &self,
        descriptor: ExchangeDescriptor,
    ) -> Result<FeedSubscription, StreamError> {
        if !self.active.write().insert(descriptor.clone()) {
            return Err(StreamError::AlreadySubscribed {
                channel: descriptor.channel(),
            });
        }

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let counters = Arc::new(StreamCounters::default());

        let task = tokio::spawn(run_stream(
            Arc::clone(&self.connections),
            Arc::clone(&self.active),
            descriptor.clone(),
            tx,
            Arc::clone(&counters),
        ));

        info!(channel = %descriptor, "Stream subscribed");

        Ok(FeedSubscription {
            descriptor,
            records: ReceiverStream::new(rx),
            task,
            counters,
        })
    }

    /// Close one descriptor; its stream ends with [`StreamExit::Closed`].
    pub async fn close(&self, descriptor: &ExchangeDescriptor) {
        self.connections.close(descriptor).await;
    }

    /// Connection state of a descriptor.
    #[must_use]
    pub fn state(&self, descriptor: &ExchangeDescriptor) -> ConnectionState {
        self.connections.state(descriptor)
    }

    /// Descriptors with a running stream.
    #[must_use]
    pub fn active_streams(&self) -> Vec<ExchangeDescriptor> {
        self.active.read().iter().cloned().collect()
    }

    /// Close every descriptor.
    pub async fn shutdown(&self) {
        self.connections.shutdown().await;
    }
}

// =============================================================================
// Read Loop
// =============================================================================

async fn run_stream(
    connections: Arc<ConnectionManager>,
    active: Arc<RwLock<HashSet<ExchangeDescriptor>>>,
    descriptor: ExchangeDescriptor,
    tx: mpsc::Sender<TickerData>,
    counters: Arc<StreamCounters>,
) -> Result<StreamExit, StreamError> {
    let mut guard = StreamGuard::new(&connections, &active, &descriptor);

    let outcome = match open(&connections, &descriptor).await {
        Ok(cancel) => {
            guard.count_open();
            pump(&connections, &descriptor, &cancel, &tx, &counters).await
        }
        Err(err) => exit_or_error(err),
    };

    guard.release().await;

    let stats = counters.snapshot();
    match &outcome {
        Ok(exit) => info!(
            channel = %descriptor,
            exit = ?exit,
            received = stats.received,
            yielded = stats.yielded,
            dropped = stats.dropped(),
            "Stream ended"
        ),
        Err(err) => error!(
            channel = %descriptor,
            error = %err,
            received = stats.received,
            yielded = stats.yielded,
            "Stream failed"
        ),
    }

    outcome
}

/// Releases a descriptor when its stream task ends, including by panic.
///
/// [`StreamGuard::release`] closes the connection on the normal path; a guard
/// dropped while still armed falls back to [`ConnectionManager::close_detached`].
struct StreamGuard<'a> {
    connections: &'a ConnectionManager,
    active: &'a RwLock<HashSet<ExchangeDescriptor>>,
    descriptor: &'a ExchangeDescriptor,
    armed: bool,
    counted: bool,
}

impl<'a> StreamGuard<'a> {
    const fn new(
        connections: &'a ConnectionManager,
        active: &'a RwLock<HashSet<ExchangeDescriptor>>,
        descriptor: &'a ExchangeDescriptor,
    ) -> Self {
        Self {
            connections,
            active,
            descriptor,
            armed: true,
            counted: false,
        }
    }

    fn count_open(&mut self) {
        metrics::adjust_open_streams(self.descriptor, 1.0);
        self.counted = true;
    }

    async fn release(mut self) {
        self.connections.close(self.descriptor).await;
        self.armed = false;
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        if self.counted {
            metrics::adjust_open_streams(self.descriptor, -1.0);
        }
        if self.armed {
            error!(channel = %self.descriptor, "Stream task aborted, closing descriptor");
            self.connections.close_detached(self.descriptor);
        }
        self.active.write().remove(self.descriptor);
    }
}

async fn open(
    connections: &ConnectionManager,
    descriptor: &ExchangeDescriptor,
) -> Result<CancellationToken, ConnectionError> {
    connections.open(descriptor).await?;
    connections
        .cancellation(descriptor)
        .ok_or_else(|| ConnectionError::Closed {
            channel: descriptor.channel(),
        })
}

async fn pump(
    connections: &ConnectionManager,
    descriptor: &ExchangeDescriptor,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<TickerData>,
    counters: &StreamCounters,
) -> Result<StreamExit, StreamError> {
    let mut normalizer = Normalizer::new(descriptor.clone());

    loop {
        // A reopened descriptor belongs to a new lifecycle
        if cancel.is_cancelled() {
            return Ok(StreamExit::Closed);
        }

        let read = tokio::select! {
            biased;
            read = connections.read(descriptor) => read,
            () = tx.closed() => return Ok(StreamExit::ConsumerDropped),
        };

        let raw = match read {
            Ok(raw) => raw,
            Err(ConnectionError::Read { source, .. }) => {
                match recover(connections, descriptor, &source, counters).await? {
                    Some(exit) => return Ok(exit),
                    None => continue,
                }
            }
            Err(err) => return exit_or_error(err),
        };

        StreamCounters::bump(&counters.received);
        metrics::record_message_received(descriptor);

        let started = Instant::now();
        let result = normalizer.normalize(&raw);
        metrics::record_normalize_duration(descriptor, started.elapsed());

        let record = match result {
            Ok(record) => record,
            Err(err) => {
                match err.kind() {
                    NormalizeErrorKind::Control => {
                        StreamCounters::bump(&counters.control);
                        debug!(channel = %descriptor, reason = %err, "Skipped control frame");
                    }
                    NormalizeErrorKind::Parse => {
                        StreamCounters::bump(&counters.dropped_parse);
                        metrics::record_message_dropped(descriptor, DropReason::Parse);
                        warn!(channel = %descriptor, error = %err, "Dropped malformed message");
                    }
                    NormalizeErrorKind::Schema => {
                        StreamCounters::bump(&counters.dropped_schema);
                        metrics::record_message_dropped(descriptor, DropReason::Schema);
                        warn!(channel = %descriptor, error = %err, "Dropped invalid record");
                    }
                }
                continue;
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(StreamExit::Closed),
            sent = tx.send(record) => {
                if sent.is_err() {
                    return Ok(StreamExit::ConsumerDropped);
                }
            }
        }

        StreamCounters::bump(&counters.yielded);
        metrics::record_record_yielded(descriptor);
    }
}

/// Hand a read error to the connection manager. `Some` ends the stream.
async fn recover(
    connections: &ConnectionManager,
    descriptor: &ExchangeDescriptor,
    source: &TransportError,
    counters: &StreamCounters,
) -> Result<Option<StreamExit>, StreamError> {
    if *source == TransportError::ReadTimeout {
        StreamCounters::bump(&counters.timeouts);
    }

    match connections.on_read_error(descriptor, source).await {
        Ok(Recovery::Retry { .. }) => Ok(None),
        Ok(Recovery::Reconnected(handle)) => {
            StreamCounters::bump(&counters.reconnects);
            info!(channel = %descriptor, handle = %handle, "Stream resumed on new handle");
            Ok(None)
        }
        Err(err) => exit_or_error(err).map(Some),
    }
}

fn exit_or_error(err: ConnectionError) -> Result<StreamExit, StreamError> {
    if err.is_closed() {
        Ok(StreamExit::Closed)
    } else {
        Err(err.into())
    }
}

// =============================================================================
// Tests
// =============================================================================
