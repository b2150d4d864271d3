//! Port Interfaces
//!
//! Contracts between the ingestion core and the outside world.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`FeedTransport`] / [`FeedSession`]: frame-level connection to the
//!   exchange feed. The WebSocket adapter implements it for production;
//!   tests script it in memory.
//! - [`CandleSink`]: consumer of the final enriched records.
//!
//! ## Codec Port
//!
//! - [`CandleDecoder`]: converts a [`RawMessage`] into a canonical record.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::candle::{CandleRecord, EnrichedCandleRecord};
use crate::domain::feed::{ParseError, RawMessage};

// =============================================================================
// Feed Transport
// =============================================================================

/// A transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Ping with payload.
    Ping(Vec<u8>),
    /// Pong with payload.
    Pong(Vec<u8>),
    /// Close frame.
    Close,
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not establish the connection (DNS, TCP, TLS).
    #[error("connection failed: {0}")]
    Connect(String),

    /// Server refused the handshake with a client error status.
    #[error("handshake rejected with status {status}: {reason}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Reason text.
        reason: String,
    },

    /// Server asked the client to back off (408 or 429 handshake).
    #[error("handshake throttled with status {status}")]
    Throttled {
        /// HTTP status code.
        status: u16,
        /// Server-requested wait from `Retry-After`.
        retry_after: Option<Duration>,
    },

    /// Read or write failure on an established connection.
    #[error("transport error: {0}")]
    Io(String),

    /// Peer closed the connection.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same request can succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// Minimum wait the server asked for before the next attempt.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Opens sessions to a feed endpoint.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Connect to `url`.
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedSession>, TransportError>;
}

/// One open connection.
#[async_trait]
pub trait FeedSession: Send {
    /// Send a frame.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Wait for the next frame. `None` means the stream ended.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Close the connection. Errors are swallowed; calling twice is harmless.
    async fn close(&mut self);
}

// =============================================================================
// Decoder
// =============================================================================

/// Converts raw feed messages into canonical records.
pub trait CandleDecoder: Send + Sync {
    /// Decode one message.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when required fields are missing or malformed.
    fn decode(&self, raw: &RawMessage) -> Result<CandleRecord, ParseError>;
}

// =============================================================================
// Sink
// =============================================================================

/// Sink write failures.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Underlying I/O failed.
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be serialized.
    #[error("sink serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Records could not be encoded in the output's file format.
    #[error("sink encoding error: {0}")]
    Encode(String),

    /// Downstream consumer is gone.
    #[error("sink closed")]
    Closed,
}

/// Consumer of the final record stream.
///
/// The pipeline does not retry failed writes; the error goes back to
/// whoever drives the pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CandleSink: Send {
    /// Write one record.
    async fn write(&mut self, record: &EnrichedCandleRecord) -> Result<(), SinkError>;

    /// Write a batch of records in order.
    async fn write_all(&mut self, records: &[EnrichedCandleRecord]) -> Result<(), SinkError> {
        for record in records {
            self.write(record).await?;
        }
        Ok(())
    }

    /// Checkpoint buffered writes. Batching sinks may keep rows that are
    /// not yet due.
    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Write out everything still buffered. Called once the input is drained.
    async fn close(&mut self) -> Result<(), SinkError> {
        self.flush().await
    }
}
