//! Stream Lifecycle Integration Tests
//!
//! Drives whole descriptors through the public `FeedService` API: connect,
//! normalize, recover from invalidated handles, and give up after repeated
//! connect failures without disturbing other streams.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_stream::StreamExt;

use gq_feed::{
    ChannelTransport, ConnectionConfig, ConnectionError, ConnectionHandle, ConnectionState,
    ExchangeRegistry, FeedService, StreamError, StreamExit, StreamRequest, Transport,
    TransportError,
};

// =============================================================================
// Scripted Transport
// =============================================================================

/// Per-channel script: connect outcomes in order, and the reads each handle
/// will serve once connected.
#[derive(Default)]
struct Script {
    connects: VecDeque<Result<(), TransportError>>,
    reads: VecDeque<VecDeque<Result<String, TransportError>>>,
}

#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    handles: Mutex<HashMap<ConnectionHandle, VecDeque<Result<String, TransportError>>>>,
    connects: Mutex<Vec<(String, Instant)>>,
    closed: Mutex<Vec<ConnectionHandle>>,
    next_id: Mutex<u64>,
}

impl ScriptedTransport {
    fn script(
        &self,
        channel: &str,
        connects: impl IntoIterator<Item = Result<(), TransportError>>,
        reads: impl IntoIterator<Item = Vec<Result<String, TransportError>>>,
    ) {
        self.scripts.lock().insert(
            channel.to_string(),
            Script {
                connects: connects.into_iter().collect(),
                reads: reads.into_iter().map(VecDeque::from).collect(),
            },
        );
    }

    fn connect_times(&self, channel: &str) -> Vec<Instant> {
        self.connects
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        exchange: &str,
        asset_class: &str,
        data_type: &str,
        symbol: &str,
    ) -> Result<ConnectionHandle, TransportError> {
        let channel = format!("{exchange}.{asset_class}.{data_type}.{symbol}");
        self.connects.lock().push((channel.clone(), Instant::now()));

        let mut scripts = self.scripts.lock();
        let script = scripts.entry(channel).or_default();
        script
            .connects
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::ConnectFailed("refused".to_string())))?;

        let mut next_id = self.next_id.lock();
        *next_id += 1;
        let handle = ConnectionHandle::new(*next_id);
        self.handles
            .lock()
            .insert(handle, script.reads.pop_front().unwrap_or_default());
        Ok(handle)
    }

    async fn read(&self, handle: ConnectionHandle) -> Result<String, TransportError> {
        let next = self
            .handles
            .lock()
            .get_mut(&handle)
            .and_then(VecDeque::pop_front);
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn close(&self, handle: ConnectionHandle) {
        self.closed.lock().push(handle);
    }
}

fn coinbase_match(trade_id: i64, second: u32) -> Result<String, TransportError> {
    Ok(format!(
        r#"{{"type":"match","trade_id":{trade_id},"product_id":"BTC-USD","size":"0.01","price":"22000.5","side":"sell","time":"2023-03-08T22:19:{second:02}.000Z"}}"#
    ))
}

fn invalidated(handle: u64) -> Result<String, TransportError> {
    Err(TransportError::HandleInvalidated {
        handle: ConnectionHandle::new(handle),
        reason: "connection reset".to_string(),
    })
}

const COINBASE: &str = "coinbase.spot.trade.BTC-USD";
const KRAKEN: &str = "kraken.spot.trade.BTC/USD";

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn well_formed_trade_yields_one_record() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.script(COINBASE, [Ok(())], [vec![coinbase_match(7, 1)]]);
    let service = FeedService::new(transport, ConnectionConfig::default(), 8);

    let mut sub = service
        .subscribe(&StreamRequest::new("coinbase", "spot", "trade", "BTC-USD"))
        .unwrap();
    let record = sub.recv().await.unwrap();

    assert_eq!(record.exchange, "coinbase");
    assert_eq!(record.data_type, "trade");
    assert_eq!(record.symbol, "BTC-USD");
    assert_eq!(record.channel, COINBASE);
    assert_eq!(record.trade.first_trade_id, 7);
    assert_eq!(record.ohlcv.open_price, record.ohlcv.close_price);
    assert_eq!(service.state(sub.descriptor()), ConnectionState::Connected);

    service.shutdown().await;
    assert_eq!(sub.join().await, Ok(StreamExit::Closed));
}

#[tokio::test]
async fn malformed_payload_is_skipped() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.script(
        COINBASE,
        [Ok(())],
        [vec![
            Ok("{\"type\":\"match\",".to_string()),
            Ok("[]".to_string()),
            coinbase_match(2, 2),
        ]],
    );
    let service = FeedService::new(transport, ConnectionConfig::default(), 8);

    let mut sub = service
        .subscribe_descriptor(ExchangeRegistry::parse_channel(COINBASE).unwrap())
        .unwrap();

    assert_eq!(sub.recv().await.unwrap().trade.first_trade_id, 2);
    let stats = sub.stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.yielded, 1);
    assert_eq!(stats.dropped_parse, 2);
}

#[tokio::test(start_paused = true)]
async fn invalidated_handle_reconnects_after_backoff() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.script(
        COINBASE,
        [Ok(()), Ok(())],
        [
            vec![coinbase_match(1, 1), coinbase_match(2, 2), invalidated(1)],
            vec![coinbase_match(3, 3), coinbase_match(4, 4)],
        ],
    );
    let config = ConnectionConfig::default();
    let min_delay = config
        .backoff
        .initial_delay
        .mul_f64(1.0 - config.backoff.jitter_factor);
    let service = FeedService::new(Arc::clone(&transport) as Arc<dyn Transport>, config, 8);

    let mut sub = service
        .subscribe_descriptor(ExchangeRegistry::parse_channel(COINBASE).unwrap())
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(sub.next().await.unwrap().trade.first_trade_id);
    }

    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(sub.stats().reconnects, 1);

    let connects = transport.connect_times(COINBASE);
    assert_eq!(connects.len(), 2);
    assert!(connects[1] - connects[0] >= min_delay);

    // An invalidated handle is discarded, never closed
    assert!(transport.closed.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_connects_fail_only_that_stream() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.script(KRAKEN, [], []);
    transport.script(COINBASE, [Ok(())], [vec![coinbase_match(1, 1)]]);
    let service = FeedService::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        ConnectionConfig::default(),
        8,
    );

    let mut failing = service
        .subscribe_descriptor(ExchangeRegistry::parse_channel(KRAKEN).unwrap())
        .unwrap();
    let mut healthy = service
        .subscribe_descriptor(ExchangeRegistry::parse_channel(COINBASE).unwrap())
        .unwrap();

    assert!(failing.recv().await.is_none());
    let err = failing.join().await.unwrap_err();
    match err {
        StreamError::Connection(ConnectionError::ConnectFailed {
            channel, attempts, ..
        }) => {
            assert_eq!(channel, KRAKEN);
            assert_eq!(attempts, 5);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(transport.connect_times(KRAKEN).len(), 5);

    assert_eq!(healthy.recv().await.unwrap().trade.first_trade_id, 1);
    assert_eq!(
        service.active_streams(),
        vec![ExchangeRegistry::parse_channel(COINBASE).unwrap()]
    );

    service.shutdown().await;
    assert_eq!(healthy.join().await, Ok(StreamExit::Closed));
}

#[tokio::test]
async fn closing_twice_is_a_no_op() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.script(COINBASE, [Ok(())], [vec![coinbase_match(1, 1)]]);
    let service = FeedService::new(transport, ConnectionConfig::default(), 8);
    let descriptor = ExchangeRegistry::parse_channel(COINBASE).unwrap();

    let mut sub = service.subscribe_descriptor(descriptor.clone()).unwrap();
    assert!(sub.recv().await.is_some());

    service.close(&descriptor).await;
    service.close(&descriptor).await;

    assert_eq!(sub.join().await, Ok(StreamExit::Closed));
    assert_eq!(service.state(&descriptor), ConnectionState::Closed);
}

// =============================================================================
// In-Process Channel Transport
// =============================================================================

#[tokio::test]
async fn channel_transport_feeds_several_exchanges() {
    let transport = Arc::new(ChannelTransport::new(16));
    let coinbase = transport.publisher(COINBASE);
    let binance = transport.publisher("binance.spot.trade.BTCUSDT");
    let service = FeedService::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        ConnectionConfig::default(),
        16,
    );

    let mut coinbase_sub = service
        .subscribe(&StreamRequest::new("coinbase", "spot", "trade", "BTC-USD"))
        .unwrap();
    let mut binance_sub = service
        .subscribe(&StreamRequest::new("binance", "spot", "trade", "BTCUSDT"))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while transport.open_connections() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    coinbase.publish(coinbase_match(11, 5).unwrap());
    binance.publish(
        r#"{"e":"trade","E":1672515782136,"s":"BTCUSDT","t":12345,"p":"16500.10","q":"0.002","T":1672515782136,"m":true}"#,
    );

    let from_coinbase = coinbase_sub.recv().await.unwrap();
    let from_binance = binance_sub.recv().await.unwrap();

    assert_eq!(from_coinbase.exchange, "coinbase");
    assert_eq!(from_coinbase.trade.first_trade_id, 11);
    assert_eq!(from_binance.exchange, "binance");
    assert_eq!(from_binance.symbol, "BTCUSDT");
    assert_eq!(from_binance.trade.first_trade_id, 12345);

    service.shutdown().await;
    assert_eq!(transport.open_connections(), 0);
}
