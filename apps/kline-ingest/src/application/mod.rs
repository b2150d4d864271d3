//! Application Layer - Use cases and port definitions.
//!
//! Ports describe how the pipeline reaches the feed and the sink;
//! services drive the domain stages over them.

/// Port interfaces for the feed transport, decoding and sinks.
pub mod ports;

/// The ingest pipeline.
pub mod services;
