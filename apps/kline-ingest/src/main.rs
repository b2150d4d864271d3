//! Kline Ingest Binary
//!
//! Streams Binance klines for the configured symbols into JSON lines or
//! partitioned Parquet files, optionally with a CSV report.
//!
//! Symbols can be added and removed at runtime through the health server:
//! `PUT /symbols/{symbol}` and `DELETE /symbols/{symbol}`.
//!
//! # Usage
//!
//! ```bash
//! KLINE_SYMBOLS=BTCUSDT,ETHUSDT cargo run --bin kline-ingest
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `KLINE_SYMBOLS`: Comma-separated symbols to track
//!
//! ## Optional
//! - `KLINE_INTERVAL`: Kline interval (default: 1m)
//! - `KLINE_STREAM_URL`: WebSocket endpoint (default: <wss://stream.binance.com:9443/ws>)
//! - `KLINE_REST_URL`: Historical klines endpoint
//! - `KLINE_BACKFILL_DAYS`: Days of history to load before streaming (default: 0)
//! - `KLINE_EMA_PERIODS`: EMA periods (default: 20,50,100,200)
//! - `KLINE_CLOSED_ONLY`: Drop in-progress candles (default: true)
//! - `KLINE_OUTPUT_FORMAT`: `jsonl` or `parquet` (default: jsonl)
//! - `KLINE_OUTPUT_PATH`: Output file or Parquet root (default: data/klines.jsonl, data/parquet)
//! - `KLINE_REPORT_PATH`: CSV report file (default: none)
//! - `KLINE_PARQUET_BATCH_ROWS`: Rows per Parquet file (default: 1000)
//! - `KLINE_PARQUET_MAX_AGE_SECS`: Longest a Parquet row stays buffered (default: 300)
//! - `KLINE_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log filter (default: `kline_ingest=info`)

use std::sync::Arc;

use anyhow::Context;
use chrono::{TimeDelta, Utc};
use kline_ingest::infrastructure::telemetry;
use kline_ingest::{
    CandleSink, HealthServer, HealthServerState, HistoricalClient, IngestConfig, IngestPipeline,
    Normalizer, OutputSink, StreamSupervisor, Symbol, WebSocketTransport, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let provider_installed = rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok();

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Kline Ingest");
    if !provider_installed {
        tracing::debug!("rustls crypto provider already installed");
    }

    let _metrics_handle = init_metrics().context("failed to install Prometheus recorder")?;

    let config = IngestConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let sink = OutputSink::open(&config.output, &config.pipeline.ema_periods)
        .await
        .with_context(|| format!("failed to open {}", config.output.path.display()))?;
    let mut pipeline =
        IngestPipeline::new(&config.pipeline_config(), Box::new(Normalizer::new()), sink)?;

    if config.backfill_days > 0 {
        backfill(&config, &mut pipeline).await?;
    }

    // Start one connection per symbol
    let supervisor = Arc::new(StreamSupervisor::new(
        config.supervisor_config(),
        Arc::new(WebSocketTransport::new()),
    ));
    supervisor.track(config.symbols.iter().cloned())?;
    let events = supervisor.events()?;
    let removals = supervisor.removals()?;

    let stats = pipeline.stats();
    let mut pipeline_task =
        tokio::spawn(async move { pipeline.run_with_removals(events, removals).await });

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&supervisor),
        stats,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(symbols = config.symbols.len(), "Kline ingest ready");

    let early_exit = tokio::select! {
        () = await_shutdown(shutdown_token.clone()) => None,
        result = &mut pipeline_task => {
            shutdown_token.cancel();
            Some(result)
        }
    };

    let report = supervisor.stop().await;
    tracing::info!(
        finished = report.finished,
        aborted = report.aborted,
        "Stream connections stopped"
    );
    for failure in supervisor.failures() {
        tracing::warn!(
            symbol = %failure.symbol(),
            error = %failure,
            "Symbol was down at shutdown"
        );
    }

    let result = match early_exit {
        Some(result) => result,
        None => pipeline_task.await,
    };
    result
        .context("pipeline task panicked")?
        .context("pipeline stopped on sink failure")?;

    tracing::info!("Kline ingest stopped");
    Ok(())
}

/// Load history for every symbol through the pipeline before streaming.
///
/// A failed fetch skips that symbol; a sink failure aborts startup.
async fn backfill<S: CandleSink>(
    config: &IngestConfig,
    pipeline: &mut IngestPipeline<S>,
) -> anyhow::Result<()> {
    let client = HistoricalClient::new(config.rest_url.clone())?;
    let end = Utc::now();
    let start = end - TimeDelta::days(i64::from(config.backfill_days));

    for symbol in &config.symbols {
        match client.fetch(symbol, config.interval, start, end).await {
            Ok(records) => {
                let fetched = records.len();
                let written = pipeline
                    .ingest_records(records)
                    .await
                    .context("backfill write failed")?;
                tracing::info!(symbol = %symbol, fetched, written, "Backfill complete");
            }
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "Backfill failed, streaming only");
            }
        }
    }
    Ok(())
}

/// Load .env file from current or ancestor directories.
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
fn log_config(config: &IngestConfig) {
    let symbols: Vec<&str> = config.symbols.iter().map(Symbol::as_str).collect();
    tracing::info!(
        symbols = ?symbols,
        interval = %config.interval,
        ema_periods = ?config.pipeline.ema_periods,
        closed_only = config.pipeline.closed_only,
        backfill_days = config.backfill_days,
        output_format = %config.output.format,
        output = %config.output.path.display(),
        report = ?config.output.report_path,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        stream_url = %config.websocket.url,
        rest_url = %config.rest_url,
        "Binance endpoints"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
    tracing::info!("Graceful shutdown started");
}
