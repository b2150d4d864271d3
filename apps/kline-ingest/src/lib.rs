#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Kline Ingest - Streaming Candlestick Ingestion
//!
//! Keeps one Binance kline WebSocket subscription per tracked symbol,
//! merges the feeds and turns them into cleaned, EMA-enriched candle
//! records.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Candle types and record transforms
//!   - `candle`: Symbols, intervals, candle records
//!   - `feed`: Raw messages and parse errors
//!   - `cleaning`: Duplicate and validity filtering
//!   - `enrichment`: Streaming EMAs
//!   - `anonymize`: Volume rounding
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Feed transport, decoder and sink interfaces
//!   - `services`: The ingest pipeline
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: Stream connection, codec, REST backfill
//!   - `supervisor`: Per-symbol connection supervision
//!   - `sink`: JSON lines, Parquet, CSV report and channel sinks
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! BTCUSDT WS ──┐
//!              │    ┌────────────┐    ┌──────────────────────────────────┐
//! ETHUSDT WS ──┼───►│ Supervisor │───►│ normalize → clean → EMA → round  │──► sink
//!              │    │  (fan-in)  │    └──────────────────────────────────┘
//! SOLUSDT WS ──┘    └────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Candle types and transforms with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::anonymize::Anonymizer;
pub use domain::candle::{
    CandleKey, CandleRecord, DomainError, EnrichedCandleRecord, Interval, SeriesKey, Symbol,
};
pub use domain::cleaning::{Deduplicator, ValidationError};
pub use domain::enrichment::{Enricher, EnrichmentError};
pub use domain::feed::{ParseError, RawMessage};

// Ports
pub use application::ports::{
    CandleDecoder, CandleSink, FeedSession, FeedTransport, Frame, SinkError, TransportError,
};

// Pipeline
pub use application::services::{
    IngestPipeline, Outcome, PipelineConfig, PipelineStats, PipelineStatsSnapshot,
};

// Binance adapters
pub use infrastructure::binance::{
    ConnectionConfig, ConnectionHandle, ConnectionStatus, FatalSubscriptionError,
    HistoricalClient, HistoryError, Normalizer, ReconnectConfig, StreamConnection,
    SubscriptionState, WebSocketTransport,
};

// Supervisor
pub use infrastructure::supervisor::{
    StopReport, StreamSupervisor, SupervisorConfig, SupervisorError,
};

// Sinks
pub use infrastructure::sink::{ChannelSink, CsvReportSink, JsonLinesSink, OutputSink, ParquetSink};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, IngestConfig, OutputFormat, OutputSettings, PipelineSettings, ServerSettings,
    WebSocketSettings,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
