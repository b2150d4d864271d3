//! Stream Codec Module
//!
//! - [`JsonCodec`]: classifies inbound text frames into acknowledgements,
//!   errors and data events, and encodes control requests.
//! - [`Normalizer`]: maps a kline event (streaming) or a kline row (REST)
//!   to a canonical [`CandleRecord`].
//!
//! The normalizer is pure: no I/O, no shared state, safe to call from any
//! task.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use super::messages::{ErrorBody, FeedReply, SubscriptionRequest};
use crate::application::ports::CandleDecoder;
use crate::domain::candle::{CandleRecord, Interval, Symbol};
use crate::domain::feed::{ParseError, RawMessage};

// =============================================================================
// JSON Codec
// =============================================================================

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is valid JSON but not an object.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the kline stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object.
    pub fn decode(&self, text: &str) -> Result<FeedReply, CodecError> {
        let value: Value = serde_json::from_str(text.trim())?;
        let Some(object) = value.as_object() else {
            let preview: String = text.trim().chars().take(50).collect();
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {preview}..."
            )));
        };

        let id = object.get("id").and_then(Value::as_u64);

        if let Some(error) = object.get("error") {
            let error: ErrorBody = serde_json::from_value(error.clone())?;
            return Ok(FeedReply::Error { id, error });
        }

        // Some endpoints report errors at top level.
        if object.contains_key("code") && object.contains_key("msg") && !object.contains_key("e") {
            let error: ErrorBody = serde_json::from_value(value.clone())?;
            return Ok(FeedReply::Error { id, error });
        }

        if object.contains_key("result")
            && let Some(id) = id
        {
            return Ok(FeedReply::Ack { id });
        }

        Ok(FeedReply::Data(value))
    }

    /// Encode a control request.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, request: &SubscriptionRequest) -> Result<String, CodecError> {
        Ok(serde_json::to_string(request)?)
    }
}

// =============================================================================
// Normalizer
// =============================================================================

/// Converts exchange kline payloads into canonical records.
#[derive(Debug, Default, Clone, Copy)]
pub struct Normalizer;

impl Normalizer {
    /// Create a new normalizer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Normalize a streaming kline event.
    ///
    /// Accepts both the raw-stream shape (`{"e":"kline","k":{..}}`) and the
    /// combined-stream envelope (`{"stream":..,"data":{..}}`). A kline
    /// without the `x` flag is treated as closed.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when the kline object or a required field is
    /// missing, or a numeric field is malformed.
    pub fn normalize(&self, raw: &RawMessage) -> Result<CandleRecord, ParseError> {
        let event = raw.payload.get("data").unwrap_or(&raw.payload);
        let kline = event
            .get("k")
            .filter(|k| k.is_object())
            .ok_or(ParseError::NotKline)?;

        let symbol_field = kline
            .get("s")
            .or_else(|| event.get("s"))
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingField("s"))?;

        Ok(CandleRecord {
            symbol: Symbol::new(symbol_field)?,
            timestamp: millis_field(kline.get("t"), "t")?,
            interval: Interval::from_str(str_field(kline.get("i"), "i")?)?,
            open: decimal_field(kline.get("o"), "o")?,
            high: decimal_field(kline.get("h"), "h")?,
            low: decimal_field(kline.get("l"), "l")?,
            close: decimal_field(kline.get("c"), "c")?,
            volume: decimal_field(kline.get("v"), "v")?,
            trade_count: count_field(kline.get("n"), "n")?,
            taker_buy_base: optional_decimal_field(kline.get("V"), "V")?,
            taker_buy_quote: optional_decimal_field(kline.get("Q"), "Q")?,
            closed: kline.get("x").and_then(Value::as_bool).unwrap_or(true),
        })
    }

    /// Normalize one row of the REST klines endpoint.
    ///
    /// Rows are fixed-position arrays:
    /// `[open_time, open, high, low, close, volume, close_time,
    ///   quote_volume, trades, taker_buy_base, taker_buy_quote, ignore]`.
    /// A row is closed when its close time is before `as_of`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when the row is too short or malformed.
    pub fn normalize_rest_row(
        &self,
        symbol: &Symbol,
        interval: Interval,
        row: &Value,
        as_of: DateTime<Utc>,
    ) -> Result<CandleRecord, ParseError> {
        let cells = row.as_array().ok_or(ParseError::NotKline)?;
        let cell = |index: usize| cells.get(index);

        let close_time = millis_field(cell(6), "close_time")?;

        Ok(CandleRecord {
            symbol: symbol.clone(),
            timestamp: millis_field(cell(0), "open_time")?,
            interval,
            open: decimal_field(cell(1), "open")?,
            high: decimal_field(cell(2), "high")?,
            low: decimal_field(cell(3), "low")?,
            close: decimal_field(cell(4), "close")?,
            volume: decimal_field(cell(5), "volume")?,
            trade_count: count_field(cell(8), "trades")?,
            taker_buy_base: optional_decimal_field(cell(9), "taker_buy_base")?,
            taker_buy_quote: optional_decimal_field(cell(10), "taker_buy_quote")?,
            closed: close_time < as_of,
        })
    }
}

impl CandleDecoder for Normalizer {
    fn decode(&self, raw: &RawMessage) -> Result<CandleRecord, ParseError> {
        self.normalize(raw)
    }
}

// =============================================================================
// Field Helpers
// =============================================================================

fn present<'a>(value: Option<&'a Value>, field: &'static str) -> Result<&'a Value, ParseError> {
    value
        .filter(|v| !v.is_null())
        .ok_or(ParseError::MissingField(field))
}

fn str_field<'a>(value: Option<&'a Value>, field: &'static str) -> Result<&'a str, ParseError> {
    let value = present(value, field)?;
    value.as_str().ok_or_else(|| ParseError::NonNumeric {
        field,
        value: value.to_string(),
    })
}

fn decimal_field(value: Option<&Value>, field: &'static str) -> Result<Decimal, ParseError> {
    let value = present(value, field)?;
    let parsed = match value {
        Value::String(s) => Decimal::from_str(s.trim())
            .or_else(|_| Decimal::from_scientific(s.trim()))
            .ok(),
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        _ => None,
    };
    parsed.ok_or_else(|| ParseError::NonNumeric {
        field,
        value: value.to_string(),
    })
}

fn optional_decimal_field(
    value: Option<&Value>,
    field: &'static str,
) -> Result<Option<Decimal>, ParseError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(_) => decimal_field(value, field).map(Some),
    }
}

fn count_field(value: Option<&Value>, field: &'static str) -> Result<u64, ParseError> {
    let value = present(value, field)?;
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ParseError::NonNumeric {
        field,
        value: value.to_string(),
    })
}

fn millis_field(value: Option<&Value>, field: &'static str) -> Result<DateTime<Utc>, ParseError> {
    let value = present(value, field)?;
    let millis = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| ParseError::NonNumeric {
        field,
        value: value.to_string(),
    })?;

    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(ParseError::InvalidTimestamp {
            field,
            value: millis,
        })
}

// =============================================================================
// Tests
// =============================================================================
