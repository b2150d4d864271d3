//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the process
//! plumbing around them.

/// Binance stream and REST adapters.
pub mod binance;

/// Per-symbol connection supervision and fan-in.
pub mod supervisor;

/// Candle sinks (JSON lines, Parquet, CSV report, channel).
pub mod sink;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
