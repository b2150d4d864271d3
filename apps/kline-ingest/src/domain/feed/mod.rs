//! Feed Message Types
//!
//! What a stream connection hands to the pipeline: one decoded JSON frame,
//! tagged with the symbol of the connection that received it. Turning the
//! payload into a [`CandleRecord`](crate::domain::candle::CandleRecord) is the
//! normalizer's job.

use chrono::{DateTime, Utc};

use crate::domain::candle::{DomainError, Symbol};

/// One inbound data frame from a symbol's stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Symbol of the connection that received the frame.
    pub symbol: Symbol,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
    /// Decoded JSON payload.
    pub payload: serde_json::Value,
}

impl RawMessage {
    /// Wrap a payload received now.
    #[must_use]
    pub fn new(symbol: Symbol, payload: serde_json::Value) -> Self {
        Self {
            symbol,
            received_at: Utc::now(),
            payload,
        }
    }
}

/// Why a raw message could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Payload carries no kline object.
    #[error("message is not a kline event")]
    NotKline,

    /// A required field is absent or null.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// A numeric field could not be read as a finite decimal or integer.
    #[error("field `{field}` is not numeric: {value}")]
    NonNumeric {
        /// Field name.
        field: &'static str,
        /// Raw value as received.
        value: String,
    },

    /// Epoch-millisecond timestamp outside the representable range.
    #[error("field `{field}` is not a valid timestamp: {value}")]
    InvalidTimestamp {
        /// Field name.
        field: &'static str,
        /// Raw value as received.
        value: i64,
    },

    /// Symbol or interval string rejected.
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl ParseError {
    /// Short label used for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotKline => "not_kline",
            Self::MissingField(_) => "missing_field",
            Self::NonNumeric { .. } => "non_numeric",
            Self::InvalidTimestamp { .. } => "invalid_timestamp",
            Self::Domain(_) => "invalid_identifier",
        }
    }
}
