//! GQ Feed Binary
//!
//! Subscribes every configured stream through the gateway and writes each
//! canonical record as one JSON line on stdout.
//!
//! # Usage
//!
//! ```bash
//! GQ_STREAMS=coinbase.spot.trade.BTC-USD,binance.spot.ticker.BTCUSDT cargo run --bin gq-feed
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `GQ_STREAMS`: Comma-separated dotted channels to subscribe
//!
//! ## Optional
//! - `GQ_GATEWAY_URL`: Gateway WebSocket URL (default: ws://localhost:5050/ws)
//! - `GQ_CONNECT_DELAY_INITIAL_MS`: First retry delay (default: 100)
//! - `GQ_CONNECT_DELAY_MAX_SECS`: Retry delay cap (default: 30)
//! - `GQ_CONNECT_DELAY_MULTIPLIER`: Retry delay multiplier (default: 2.0)
//! - `GQ_MAX_CONNECT_ATTEMPTS`: Connect attempts per descriptor (default: 5)
//! - `GQ_MAX_CONSECUTIVE_TIMEOUTS`: Timeouts before a forced reconnect (default: 3)
//! - `GQ_READ_TIMEOUT_SECS`: Gateway read timeout (default: 30)
//! - `GQ_CHANNEL_CAPACITY`: Buffered records per stream (default: 1024)
//! - `GQ_METRICS_PORT`: Prometheus metrics port (default: 0, disabled)
//! - `GQ_CSV_PATH`: Also append records to this CSV file
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log filter; logs go to stderr

use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gq_feed::infrastructure::telemetry;
use gq_feed::{
    ConnectionConfig, CsvExporter, FeedConfig, FeedService, FeedSubscription, GatewayConfig,
    GatewayTransport, MetricsConfig, TickerData, init_metrics,
};
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Fails only when a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting GQ Feed");

    let config = FeedConfig::from_env().context("failed to load configuration")?;
    log_config(&config);

    if config.server.metrics_port != 0 {
        init_metrics(&MetricsConfig::with_port(config.server.metrics_port))
            .context("failed to start metrics exporter")?;
    }

    let csv = config
        .csv_path
        .as_ref()
        .map(CsvExporter::<File>::append)
        .transpose()
        .context("failed to open CSV export")?;

    let transport = Arc::new(GatewayTransport::new(GatewayConfig::from_feed_config(
        &config,
    )));
    let service = FeedService::new(
        transport,
        ConnectionConfig::from_connection_settings(&config.connection),
        config.connection.channel_capacity,
    );

    let (records_tx, records_rx) = mpsc::channel(config.connection.channel_capacity);
    let writer = tokio::spawn(write_records(records_rx, csv));

    let mut streams = JoinSet::new();
    for descriptor in &config.streams {
        let subscription = service
            .subscribe_descriptor(descriptor.clone())
            .with_context(|| format!("failed to subscribe {}", descriptor.channel()))?;
        streams.spawn(forward(subscription, records_tx.clone()));
    }
    drop(records_tx);

    tokio::select! {
        result = await_shutdown() => result?,
        () = async { while streams.join_next().await.is_some() {} } => {
            tracing::warn!("All streams ended");
        }
    }

    service.shutdown().await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while streams.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Streams did not stop in time, aborting"
        );
        streams.abort_all();
    }

    let written = writer.await.context("record writer panicked")??;
    tracing::info!(records = written, "GQ Feed stopped");

    Ok(())
}

/// Forward one subscription's records to the shared writer, then log how the
/// stream ended. A failed stream never stops the others.
async fn forward(mut subscription: FeedSubscription, records: mpsc::Sender<TickerData>) {
    while let Some(record) = subscription.recv().await {
        if records.send(record).await.is_err() {
            break;
        }
    }

    let channel = subscription.descriptor().channel();
    let stats = subscription.stats();
    match subscription.join().await {
        Ok(exit) => tracing::info!(
            channel = %channel,
            exit = ?exit,
            yielded = stats.yielded,
            dropped = stats.dropped(),
            "Stream finished"
        ),
        Err(e) => tracing::error!(
            channel = %channel,
            error = %e,
            yielded = stats.yielded,
            "Stream failed"
        ),
    }
}

/// Write records as JSON lines on stdout, and to CSV when configured.
async fn write_records(
    mut records: mpsc::Receiver<TickerData>,
    mut csv: Option<CsvExporter<File>>,
) -> anyhow::Result<u64> {
    let mut stdout = tokio::io::stdout();
    let mut written = 0;

    while let Some(record) = records.recv().await {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;

        if let Some(exporter) = csv.as_mut() {
            exporter.write(&record)?;
            exporter.flush()?;
        }
        written += 1;
    }

    stdout.flush().await?;
    Ok(written)
}

/// Load .env file from the current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &FeedConfig) {
    tracing::info!(
        gateway_url = %config.gateway_url,
        streams = config.streams.len(),
        metrics_port = config.server.metrics_port,
        csv = config.csv_path.is_some(),
        "Configuration loaded"
    );
    for descriptor in &config.streams {
        tracing::debug!(channel = %descriptor.channel(), "Configured stream");
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() -> anyhow::Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.map(|()| "Ctrl+C") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())?
            .recv()
            .await;
        Ok::<_, std::io::Error>("SIGTERM")
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<&'static str>>();

    let result = tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    };
    let received = result.context("failed to install signal handler")?;

    tracing::info!(signal = received, "Received shutdown signal");
    Ok(())
}
