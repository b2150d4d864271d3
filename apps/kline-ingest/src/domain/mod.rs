//! Domain Layer - Candle types and the stateful record transforms.
//!
//! Nothing in this layer performs I/O. Each transform is owned by the
//! single pipeline task, so none of them need interior locking.

/// Canonical candle records and identifiers.
pub mod candle;

/// Raw feed messages and parse errors.
pub mod feed;

/// Deduplication and validity filtering.
pub mod cleaning;

/// Streaming EMA enrichment.
pub mod enrichment;

/// Volume rounding.
pub mod anonymize;
