//! Prometheus Metrics Module
//!
//! Exposes ingestion metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Feed**: raw messages received, reconnects and fatal failures per symbol
//! - **Pipeline**: parse errors, rejected records by reason, records written
//! - **Connections**: number of connections in each lifecycle state
//! - **Latency**: per-record pipeline processing time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Later calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Feed counters
    describe_counter!(
        "kline_ingest_messages_received_total",
        "Total raw messages received from the kline feed"
    );
    describe_counter!(
        "kline_ingest_reconnects_total",
        "Total stream reconnection attempts"
    );
    describe_counter!(
        "kline_ingest_fatal_subscriptions_total",
        "Total symbols marked permanently down"
    );

    // Pipeline counters
    describe_counter!(
        "kline_ingest_parse_errors_total",
        "Total raw messages that could not be normalized"
    );
    describe_counter!(
        "kline_ingest_records_rejected_total",
        "Total records dropped before enrichment, by reason"
    );
    describe_counter!(
        "kline_ingest_records_written_total",
        "Total enriched records handed to the sink"
    );
    describe_counter!(
        "kline_ingest_sink_errors_total",
        "Total sink write failures"
    );

    // Connection gauges
    describe_gauge!(
        "kline_ingest_connections",
        "Number of stream connections in each state"
    );

    // Latency histograms
    describe_histogram!(
        "kline_ingest_record_processing_seconds",
        "Time from raw message to sink write"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a raw message received on a symbol's stream.
pub fn record_message_received(symbol: &str) {
    counter!(
        "kline_ingest_messages_received_total",
        "symbol" => symbol.to_string()
    )
    .increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect(symbol: &str) {
    counter!(
        "kline_ingest_reconnects_total",
        "symbol" => symbol.to_string()
    )
    .increment(1);
}

/// Record a symbol going permanently down.
pub fn record_fatal_subscription(symbol: &str, reason: &'static str) {
    counter!(
        "kline_ingest_fatal_subscriptions_total",
        "symbol" => symbol.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a normalization failure.
pub fn record_parse_error(kind: &'static str) {
    counter!(
        "kline_ingest_parse_errors_total",
        "kind" => kind
    )
    .increment(1);
}

/// Record a record dropped by the cleaner or the closed-only filter.
pub fn record_rejected(reason: &'static str) {
    counter!(
        "kline_ingest_records_rejected_total",
        "reason" => reason
    )
    .increment(1);
}

/// Record records handed to the sink.
pub fn record_written(count: u64) {
    counter!("kline_ingest_records_written_total").increment(count);
}

/// Record a sink failure.
pub fn record_sink_error() {
    counter!("kline_ingest_sink_errors_total").increment(1);
}

/// Update the number of connections in one state.
pub fn set_connections(state: &'static str, count: f64) {
    gauge!(
        "kline_ingest_connections",
        "state" => state
    )
    .set(count);
}

/// Record per-record processing duration.
pub fn record_processing_duration(duration: Duration) {
    histogram!("kline_ingest_record_processing_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
